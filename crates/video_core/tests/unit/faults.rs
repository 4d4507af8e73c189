//! # BDA and Fault Tests
//!
//! BDA page table maintenance and fault-buffer driven buffer creation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpucache_core::CacheError;
use gpucache_core::common::CACHING_PAGEBITS;
use gpucache_core::device::{Barrier, Device, HostDevice};
use gpucache_core::traits::{NullPageWatcher, NullTextureCache};
use pretty_assertions::assert_eq;

use crate::common::harness::{TestCache, small_config};

fn bda_entry(t: &TestCache, addr: u64) -> u64 {
    let table = t.cache.bda_pagetable_buffer().unwrap().handle();
    let mut raw = [0u8; 8];
    t.device
        .read_buffer(table, (addr >> CACHING_PAGEBITS) * 8, &mut raw)
        .unwrap();
    u64::from_le_bytes(raw)
}

fn raise_fault(t: &TestCache, addr: u64) {
    let fault = t.cache.fault_buffer().unwrap().handle();
    let page = addr >> CACHING_PAGEBITS;
    let mut byte = [0u8; 1];
    t.device.read_buffer(fault, page / 8, &mut byte).unwrap();
    byte[0] |= 1 << (page % 8);
    t.device.write_buffer(fault, page / 8, &byte).unwrap();
}

#[test]
fn bda_buffers_exist_only_when_enabled() {
    let t = TestCache::default();
    assert!(t.cache.bda_pagetable_buffer().is_none());
    assert!(t.cache.fault_buffer().is_none());
    let err = t.cache.process_fault_buffer().unwrap_err();
    assert!(matches!(err, CacheError::BdaDisabled));

    let t = TestCache::new(small_config(true));
    assert!(t.cache.bda_pagetable_buffer().is_some());
    assert!(t.cache.fault_buffer().is_some());
}

#[test]
fn registration_writes_bda_entries() {
    let t = TestCache::new(small_config(true));
    let slice = t.cache.obtain_buffer(0x40000, 0x10, false, false, None).unwrap();
    let device_address = t.cache.buffer(slice.id).device_address();
    assert_eq!(bda_entry(&t, 0x40000), device_address);
    assert_eq!(bda_entry(&t, 0x44000), 0);

    // Growing replaces the entries with the new buffer's addresses.
    let grown = t.cache.obtain_buffer(0x43ff0, 0x20, false, false, None).unwrap();
    let grown_address = t.cache.buffer(grown.id).device_address();
    assert_eq!(bda_entry(&t, 0x40000), grown_address);
    assert_eq!(bda_entry(&t, 0x44000), grown_address + 0x4000);

    t.cache.invalidate_memory(0x40000, 0x8000).unwrap();
    assert_eq!(bda_entry(&t, 0x40000), 0);
    assert_eq!(bda_entry(&t, 0x44000), 0);
}

#[test]
fn faults_create_buffers_for_unbacked_pages() {
    let t = TestCache::new(small_config(true));
    t.cpu_write(0x84000, &[0x5A; 16]);
    raise_fault(&t, 0x80000);
    raise_fault(&t, 0x84000);
    raise_fault(&t, 0xC0000);

    assert_eq!(t.cache.process_fault_buffer().unwrap(), 3);
    let id = t.cache.find_buffer(0x80000, 0x8000);
    assert!(!id.is_null());
    assert!(!t.cache.find_buffer(0xC0000, 0x4000).is_null());
    assert_eq!(t.cache.live_buffer_count(), 2);
    assert_eq!(t.cache.stats().faults_processed, 3);

    // Faulting pages are uploaded so the resubmitted work sees guest data.
    let slice = t.cache.obtain_buffer_for_image(0x84000, 16).unwrap().unwrap();
    assert_eq!(t.device_read(&slice, 16), vec![0x5A; 16]);

    // Bits were cleared by the scan.
    assert_eq!(t.cache.process_fault_buffer().unwrap(), 0);
}

#[test]
fn faults_on_backed_pages_keep_existing_buffers() {
    let t = TestCache::new(small_config(true));
    let id = t.cache.obtain_buffer(0x80000, 0x10, false, false, None).unwrap().id;
    raise_fault(&t, 0x80000);

    assert_eq!(t.cache.process_fault_buffer().unwrap(), 1);
    assert_eq!(t.cache.find_buffer(0x80000, 0x4000), id);
    assert_eq!(t.cache.stats().buffers_created, 1);
}

#[test]
fn fault_scan_is_capped_per_call() {
    let mut config = small_config(true);
    config.general.max_page_faults = 2;
    let t = TestCache::new(config);
    for page in 0..5u64 {
        raise_fault(&t, 0x100000 + page * 0x10000);
    }

    assert_eq!(t.cache.process_fault_buffer().unwrap(), 2);
    assert_eq!(t.cache.process_fault_buffer().unwrap(), 2);
    assert_eq!(t.cache.process_fault_buffer().unwrap(), 1);
    assert_eq!(t.cache.live_buffer_count(), 5);
}

#[test]
fn fault_scan_leaves_staged_downloads_alone() {
    let mut config = small_config(true);
    config.stream.download_size = 0x4000;
    config.general.max_page_faults = 1;
    let device = HostDevice::new();
    // Retire a few device ticks so they overlap the download tick numbers.
    let _ = device.flush();
    let _ = device.flush();
    device.hold_completion();
    let t = TestCache::build(
        config,
        device,
        Arc::new(NullPageWatcher),
        Arc::new(NullTextureCache),
    );

    // Fill the whole download ring with a scheduled download.
    let _ = t.gpu_write(0x8000, &[0xAB; 0x4000]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());

    thread::scope(|s| {
        let _ = s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            t.device.release_completion();
        });
        assert_eq!(t.cache.process_fault_buffer().unwrap(), 0);
    });

    t.cache.read_memory(0x8000, 0x4000).unwrap();
    assert_eq!(t.cpu_read(0x8000, 0x4000), vec![0xAB; 0x4000]);
    assert_eq!(t.cache.download_tick(), 1);
}

#[test]
fn memory_barrier_is_recorded() {
    let t = TestCache::default();
    t.cache.memory_barrier();
    assert_eq!(t.device.barriers().last(), Some(&Barrier::Memory));
}
