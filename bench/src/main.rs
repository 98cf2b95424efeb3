use armjit::config::JitConfig;
use armjit::jit::{JitCache, JitStats};
use armjit::workload::{Workload, WorkloadSettings};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    capacity: usize,
    buffer_size: usize,
    elapsed_secs: f64,
    steps_per_sec: f64,
    translations: u64,
    stats: JitStats,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

struct Scenario {
    name: &'static str,
    capacity: usize,
    buffer_size: usize,
    write_ratio: f64,
    code_sites: usize,
}

const SCENARIOS: &[Scenario] = &[
    // Working set fits; measures lookup and the invalidation fast path
    Scenario {
        name: "resident",
        capacity: 5120,
        buffer_size: 1024,
        write_ratio: 0.2,
        code_sites: 2048,
    },
    // Working set is four times the cache; sweeps dominate
    Scenario {
        name: "thrashing",
        capacity: 1024,
        buffer_size: 256,
        write_ratio: 0.1,
        code_sites: 4096,
    },
    // Store-heavy guest with coarse granules
    Scenario {
        name: "store_heavy",
        capacity: 5120,
        buffer_size: 4096,
        write_ratio: 0.6,
        code_sites: 8192,
    },
];

const STEPS: u64 = 1_000_000;

fn run_scenario(scenario: &Scenario) -> BenchmarkResult {
    let config = JitConfig {
        enabled: true,
        capacity: scenario.capacity,
        buffer_size: scenario.buffer_size,
        ..Default::default()
    };

    let settings = WorkloadSettings {
        steps: STEPS,
        seed: 0x6BA,
        write_ratio: scenario.write_ratio,
        code_sites: scenario.code_sites,
        ..Default::default()
    };

    let start = Instant::now();
    let outcome = JitCache::new(config).and_then(|mut cache| {
        cache.reset()?;
        Workload::new(settings).run(&mut cache)
    });
    let elapsed = start.elapsed().as_secs_f64();

    let (translations, stats) = match outcome {
        Ok(report) => (report.translations, report.stats),
        Err(e) => {
            eprintln!("Benchmark {} failed: {}", scenario.name, e);
            (0, JitStats::default())
        }
    };

    BenchmarkResult {
        name: scenario.name.to_string(),
        capacity: scenario.capacity,
        buffer_size: scenario.buffer_size,
        elapsed_secs: elapsed,
        steps_per_sec: STEPS as f64 / elapsed.max(f64::EPSILON),
        translations,
        stats,
    }
}

fn main() {
    let results = SCENARIOS.iter().map(run_scenario).collect();
    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
