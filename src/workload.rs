//! Synthetic guest workload for exercising the cache without a real core.
//!
//! A seeded generator emits instruction fetches over a skewed set of code
//! sites and guest stores into work RAM. Misses are "translated" by writing a
//! fixed stub, which is all the cache needs to see.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::jit::region::{BASE_BIOS, BASE_WORKING_IRAM, BASE_WORKING_RAM, SIZE_WORKING_IRAM, SIZE_WORKING_RAM};
use crate::jit::{CpuState, Entry, JitCache, JitError, JitStats};

/// Bytes written into a buffer for every stand-in translation.
const STUB_CODE: &[u8] = &[0xC3];

const BASE_CART: u32 = 0x0800_0000;
const SIZE_CART_WINDOW: u32 = 0x0100_0000;
const SIZE_BIOS: u32 = 0x4000;

#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub steps: u64,
    pub seed: u64,
    /// Fraction of steps that are guest stores
    pub write_ratio: f64,
    /// Number of distinct code sites fetched from
    pub code_sites: usize,
    /// Guest bytes covered by each stand-in translation
    pub block_size: u32,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            steps: 100_000,
            seed: 0,
            write_ratio: 0.2,
            code_sites: 8192,
            block_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOp {
    Fetch { pc: u32, thumb: bool },
    Store { address: u32, size: u32 },
}

/// Summary of one workload run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub steps: u64,
    pub fetches: u64,
    pub stores: u64,
    pub translations: u64,
    pub self_modified: u64,
    pub live_blocks: usize,
    pub stats: JitStats,
}

pub struct Workload {
    rng: StdRng,
    settings: WorkloadSettings,
    sites: Vec<(u32, bool)>,
}

impl Workload {
    pub fn new(settings: WorkloadSettings) -> Self {
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let sites = (0..settings.code_sites.max(1))
            .map(|_| random_site(&mut rng))
            .collect();
        Self {
            rng,
            settings,
            sites,
        }
    }

    /// Next guest event. Popular sites are picked far more often than cold ones.
    pub fn next_op(&mut self) -> GuestOp {
        if self.rng.gen_bool(self.settings.write_ratio.clamp(0.0, 1.0)) {
            let (base, size) = if self.rng.gen_bool(0.5) {
                (BASE_WORKING_RAM, SIZE_WORKING_RAM)
            } else {
                (BASE_WORKING_IRAM, SIZE_WORKING_IRAM)
            };
            let width = match self.rng.gen_range(0..16) {
                0 => 0x200,
                1..=5 => 1,
                6..=10 => 2,
                _ => 4,
            };
            let address = base + (self.rng.gen_range(0..size) & !(width.min(4) - 1));
            return GuestOp::Store {
                address,
                size: width,
            };
        }

        let skew: f64 = self.rng.gen_range(0.0..1.0);
        let index = ((skew * skew * skew) * self.sites.len() as f64) as usize;
        let (pc, thumb) = self.sites[index.min(self.sites.len() - 1)];
        GuestOp::Fetch { pc, thumb }
    }

    /// Drive `cache` for the configured number of steps.
    pub fn run(&mut self, cache: &mut JitCache) -> Result<WorkloadReport, JitError> {
        let mut report = WorkloadReport {
            steps: self.settings.steps,
            fetches: 0,
            stores: 0,
            translations: 0,
            self_modified: 0,
            live_blocks: 0,
            stats: JitStats::default(),
        };

        for _ in 0..self.settings.steps {
            match self.next_op() {
                GuestOp::Fetch { pc, thumb } => {
                    report.fetches += 1;
                    match cache.enter(&CpuState { pc, thumb }) {
                        Entry::Hit { .. } => {
                            if cache.leave() {
                                report.self_modified += 1;
                            }
                        }
                        Entry::Miss => {
                            let index = cache.allocate_block()?;
                            cache.write_block(index, STUB_CODE)?;
                            let size = self.block_size_at(pc);
                            cache.bind_block(index, pc, size, thumb)?;
                            report.translations += 1;
                        }
                        Entry::Disabled | Entry::NotJitable | Entry::Reentrant => {}
                    }
                }
                GuestOp::Store { address, size } => {
                    report.stores += 1;
                    cache.invalidate_memory(address, size)?;
                }
            }
        }

        report.live_blocks = cache.table().map_or(0, |table| table.live_count());
        report.stats = cache.stats();
        Ok(report)
    }

    /// Block length clipped so the block never leaves its 16 MiB region.
    fn block_size_at(&self, pc: u32) -> u32 {
        let to_region_end = (pc | 0x00FF_FFFF) - pc + 1;
        self.settings.block_size.clamp(1, to_region_end)
    }
}

fn random_site(rng: &mut StdRng) -> (u32, bool) {
    let thumb = rng.gen_bool(0.7);
    let align = if thumb { !1 } else { !3 };
    let pc = match rng.gen_range(0..20) {
        0 => BASE_BIOS + rng.gen_range(0..SIZE_BIOS),
        1..=3 => BASE_WORKING_RAM + rng.gen_range(0..SIZE_WORKING_RAM),
        4..=7 => BASE_WORKING_IRAM + rng.gen_range(0..SIZE_WORKING_IRAM),
        _ => BASE_CART + rng.gen_range(0..SIZE_CART_WINDOW),
    };
    (pc & align, thumb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;

    fn cache(capacity: usize) -> JitCache {
        let mut cache = JitCache::new(JitConfig {
            enabled: true,
            capacity,
            buffer_size: 64,
            ..Default::default()
        })
        .unwrap();
        cache.reset().unwrap();
        cache
    }

    #[test]
    fn test_same_seed_same_ops() {
        let settings = WorkloadSettings {
            seed: 7,
            ..Default::default()
        };
        let mut a = Workload::new(settings.clone());
        let mut b = Workload::new(settings);
        for _ in 0..1000 {
            assert_eq!(a.next_op(), b.next_op());
        }
    }

    #[test]
    fn test_run_under_pressure() {
        let mut cache = cache(32);
        let mut workload = Workload::new(WorkloadSettings {
            steps: 5_000,
            seed: 3,
            code_sites: 256,
            ..Default::default()
        });
        let report = workload.run(&mut cache).unwrap();

        assert_eq!(report.fetches + report.stores, 5_000);
        assert!(report.translations > 32);
        assert!(report.stats.sweeps > 0);
        assert!(report.live_blocks <= 32);
        assert_eq!(report.stats.hits + report.stats.misses, report.fetches);
    }

    #[test]
    fn test_run_disabled_translates_nothing() {
        let mut cache = JitCache::new(JitConfig::default()).unwrap();
        let mut workload = Workload::new(WorkloadSettings {
            steps: 500,
            ..Default::default()
        });
        let report = workload.run(&mut cache).unwrap();
        assert_eq!(report.translations, 0);
        assert_eq!(report.live_blocks, 0);
    }
}
