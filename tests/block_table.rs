//! Block table behaviour driven through the public API: eviction sweeps,
//! free-list bookkeeping, and handle invalidation.

use std::collections::HashSet;

use armjit::config::JitConfig;
use armjit::jit::{BlockTable, JitError, SlotIndex};

fn table(capacity: usize, buffer_size: usize) -> BlockTable {
    BlockTable::new(&JitConfig {
        capacity,
        buffer_size,
        ..Default::default()
    })
    .unwrap()
}

fn translate(table: &mut BlockTable, start: u32, size: u32) -> SlotIndex {
    let index = table.allocate().unwrap();
    table.write_code(index, &[0x90, 0xC3]).unwrap();
    table.bind(index, start, size, false).unwrap();
    index
}

fn invoke(table: &mut BlockTable, index: SlotIndex, times: u16) {
    for _ in 0..times {
        table.record_invocation(index);
    }
}

/// Every free slot is reachable from the head exactly once, and nothing else is.
fn assert_free_list_closed(table: &BlockTable) {
    let reachable: Vec<SlotIndex> = table.free_list().collect();
    let unique: HashSet<SlotIndex> = reachable.iter().copied().collect();
    assert_eq!(unique.len(), reachable.len(), "free list revisits a slot");

    let free: HashSet<SlotIndex> = table
        .records()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_free())
        .map(|(i, _)| SlotIndex::new(i as u16))
        .collect();
    assert_eq!(unique, free);
    assert_eq!(table.free_count(), free.len());

    for record in table.records().iter().filter(|r| r.is_free()) {
        assert_eq!(record.guest_size(), 0);
    }
}

#[test]
fn test_sweep_frees_least_invoked() {
    let mut table = table(4, 16);
    assert_eq!(table.eviction_batch(), 2);

    let slots: Vec<SlotIndex> = (0..4u32).map(|i| translate(&mut table, i * 16, 16)).collect();
    for (&index, count) in slots.iter().zip([5u16, 1, 3, 2]) {
        invoke(&mut table, index, count);
    }

    assert_eq!(table.sweep().unwrap(), 2);

    for i in [1usize, 3] {
        assert!(table.records()[i].is_free());
        assert_eq!(table.records()[i].guest_start(), 0xFFFF_FFFF);
    }

    for (i, start) in [(0usize, 0u32), (2, 32)] {
        let record = &table.records()[i];
        assert!(record.is_live());
        assert_eq!(record.guest_start(), start);
        assert_eq!(record.guest_size(), 16);
        assert_eq!(record.invocations(), 0);
    }
    assert_free_list_closed(&table);
}

#[test]
fn test_sweep_breaks_ties_by_index() {
    let mut table = table(6, 16);
    let slots: Vec<SlotIndex> = (0..6u32).map(|i| translate(&mut table, i * 16, 16)).collect();
    for &index in &slots[3..] {
        invoke(&mut table, index, 1);
    }
    table.sweep().unwrap();
    let live: Vec<usize> = table
        .records()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_live())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(live, vec![3, 4, 5]);
}

#[test]
fn test_allocate_on_full_table_evicts_half() {
    let capacity = 5120;
    let mut table = table(capacity, 16);
    for i in 0..capacity as u32 {
        translate(&mut table, 0x0800_0000 + i * 16, 16);
    }
    assert_eq!(table.free_count(), 0);

    let index = table.allocate().unwrap();
    assert!(table.records()[index.as_usize()].is_reserved());
    assert_eq!(table.sweeps(), 1);
    assert_eq!(table.evicted(), 2560);
    assert_eq!(table.free_count(), 2560 - 1);
    assert_eq!(table.live_count(), 2560);
    assert_free_list_closed(&table);
}

#[test]
fn test_sweep_ignores_reserved_slots() {
    let mut table = table(4, 16);
    let reserved = table.allocate().unwrap();
    for i in 0..3u32 {
        translate(&mut table, 0x0800_0000 + i * 16, 16);
    }

    table.sweep().unwrap();
    assert!(table.records()[reserved.as_usize()].is_reserved());
    assert_eq!(table.live_count(), 1);
    assert_free_list_closed(&table);
}

#[test]
fn test_allocate_exhausted_when_all_reserved() {
    let mut table = table(2, 16);
    table.allocate().unwrap();
    table.allocate().unwrap();
    assert!(matches!(table.allocate(), Err(JitError::Exhausted)));
}

#[test]
fn test_free_list_survives_mixed_operations() {
    let mut table = table(64, 32);
    let mut live = Vec::new();
    for round in 0..40u32 {
        let index = translate(&mut table, 0x0800_0000 + round * 64, 32);
        live.push(index);
        if round % 3 == 0 {
            let victim = live.remove(0);
            table.free(victim).unwrap();
        }
        if round % 7 == 0 && live.len() >= 2 {
            let batch: Vec<SlotIndex> = live.drain(..2).collect();
            table.free_many(&batch).unwrap();
        }
        live.retain(|&i| table.records()[i.as_usize()].is_live());
        assert_free_list_closed(&table);
    }
}

#[test]
fn test_double_free_is_rejected() {
    let mut table = table(4, 16);
    let index = translate(&mut table, 0x0800_0000, 16);
    table.free(index).unwrap();
    assert!(matches!(table.free(index), Err(JitError::DoubleFree(i)) if i == index));
    assert_free_list_closed(&table);
}

#[test]
fn test_free_many_is_all_or_nothing() {
    let mut table = table(4, 16);
    let a = translate(&mut table, 0x0800_0000, 16);
    let b = translate(&mut table, 0x0800_0100, 16);

    assert!(table.free_many(&[a, b, a]).is_err());
    assert!(table.records()[a.as_usize()].is_live());
    assert!(table.records()[b.as_usize()].is_live());

    assert!(matches!(
        table.free_many(&[a, SlotIndex::new(9)]),
        Err(JitError::InvalidSlot(9))
    ));
    assert_eq!(table.free_many(&[a, b]).unwrap(), 2);
    assert_free_list_closed(&table);
}

#[test]
fn test_stale_handle_stops_resolving() {
    let mut table = table(2, 16);
    let index = table.allocate().unwrap();
    let handle = table.bind(index, 0x0800_0000, 16, true).unwrap();
    assert!(table.entry_point(handle).is_some());

    table.free(index).unwrap();
    assert!(table.entry_point(handle).is_none());

    // Same slot, new translation: the old handle still does not resolve.
    let again = table.allocate().unwrap();
    assert_eq!(again, index);
    let fresh = table.bind(again, 0x0800_0040, 16, true).unwrap();
    assert!(table.entry_point(handle).is_none());
    assert!(table.entry_point(fresh).is_some());
}

#[test]
fn test_bind_rejects_bad_ranges() {
    let mut table = table(4, 16);
    let index = table.allocate().unwrap();
    for (start, size) in [
        (0x0800_0000, 0),
        (0x0400_0000, 16),
        (0x02FF_FFF8, 16),
        (0xFFFF_FFF0, 0x20),
    ] {
        assert!(
            matches!(table.bind(index, start, size, false), Err(JitError::InvalidRange { .. })),
            "{:#x}+{} should be rejected",
            start,
            size
        );
    }
    assert!(table.records()[index.as_usize()].is_reserved());
}
