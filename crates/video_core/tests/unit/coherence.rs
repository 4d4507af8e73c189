//! # Coherence Tests
//!
//! Upload fidelity, page watching and CPU invalidation.

use std::sync::Arc;

use gpucache_core::common::AddrRange;
use gpucache_core::device::HostDevice;
use gpucache_core::traits::NullTextureCache;
use mockall::predicate::eq;
use pretty_assertions::assert_eq;

use crate::common::harness::{TestCache, small_config};
use crate::common::mocks::MockWatcher;

// ══════════════════════════════════════════════════════════
// 1. Uploads
// ══════════════════════════════════════════════════════════

#[test]
fn obtain_uploads_guest_contents() {
    let t = TestCache::default();
    let pattern: Vec<u8> = (0..=255).collect();
    t.cpu_write(0x4000, &pattern);

    let slice = t.cache.obtain_buffer(0x4000, 256, false, false, None).unwrap();
    assert_eq!(t.device_read(&slice, 256), pattern);

    let stats = t.cache.stats();
    assert_eq!(stats.uploads, 1);
    assert_eq!(stats.upload_bytes, 0x1000);
}

#[test]
fn clean_pages_are_not_uploaded_again() {
    let t = TestCache::default();
    t.cpu_write(0x20000, &[1; 64]);
    let _ = t.cache.obtain_buffer(0x20000, 64, false, false, None).unwrap();

    // Without an invalidation the cache keeps its copy.
    t.cpu_write(0x20000, &[2; 64]);
    let slice = t.cache.obtain_buffer(0x20000, 64, false, false, None).unwrap();
    assert_eq!(t.device_read(&slice, 64), vec![1; 64]);
    assert_eq!(t.cache.stats().uploads, 1);
}

#[test]
fn synchronize_in_range_uploads_every_buffer() {
    let t = TestCache::default();
    let a = t.cache.obtain_buffer(0x10000, 0x10, false, false, None).unwrap();
    let b = t.cache.obtain_buffer(0x18000, 0x10, false, false, None).unwrap();
    t.cpu_write(0x10000, &[3; 0x10]);
    t.cpu_write(0x18000, &[4; 0x10]);
    t.cache.invalidate_memory(0x10000, 0x10).unwrap();
    t.cache.invalidate_memory(0x18000, 0x10).unwrap();

    t.cache.synchronize_buffers_in_range(0x10000, 0x10000).unwrap();
    assert_eq!(t.device_read(&a, 0x10), vec![3; 0x10]);
    assert_eq!(t.device_read(&b, 0x10), vec![4; 0x10]);
}

#[test]
fn uploads_start_and_stop_write_watches() {
    let mut watcher = MockWatcher::new();
    let _ = watcher
        .expect_update_write_watch()
        .with(eq(0x1000), eq(0x1000), eq(true))
        .times(1)
        .return_const(());
    let _ = watcher
        .expect_update_write_watch()
        .with(eq(0x1000), eq(0x1000), eq(false))
        .times(1)
        .return_const(());
    let _ = watcher.expect_update_read_watch().never();
    let t = TestCache::build(
        small_config(false),
        HostDevice::new(),
        Arc::new(watcher),
        Arc::new(NullTextureCache),
    );

    let _ = t.cache.obtain_buffer(0x1000, 0x40, false, false, None).unwrap();
    t.cache.invalidate_memory(0x1010, 0x10).unwrap();
}

#[test]
fn gpu_writes_are_read_watched_with_readbacks() {
    let mut watcher = MockWatcher::new();
    let _ = watcher.expect_update_write_watch().return_const(());
    let _ = watcher
        .expect_update_read_watch()
        .with(eq(0x2000), eq(0x1000), eq(true))
        .times(1)
        .return_const(());
    let t = TestCache::build(
        small_config(false),
        HostDevice::new(),
        Arc::new(watcher),
        Arc::new(NullTextureCache),
    );

    let _ = t.gpu_write(0x2000, &[7; 0x20]);
}

// ══════════════════════════════════════════════════════════
// 2. Invalidation
// ══════════════════════════════════════════════════════════

#[test]
fn invalidated_memory_is_uploaded_again() {
    let t = TestCache::default();
    t.cpu_write(0x20000, &[1; 64]);
    let _ = t.cache.obtain_buffer(0x20000, 64, false, false, None).unwrap();

    t.cpu_write(0x20000, &[2; 64]);
    t.cache.invalidate_memory(0x20000, 64).unwrap();
    assert!(t.cache.is_region_cpu_modified(0x20000, 64));

    let slice = t.cache.obtain_buffer(0x20000, 64, false, false, None).unwrap();
    assert_eq!(t.device_read(&slice, 64), vec![2; 64]);
    assert_eq!(t.cache.stats().invalidations, 1);
}

#[test]
fn invalidation_deletes_fully_covered_buffers() {
    let t = TestCache::default();
    let id = t.cache.obtain_buffer(0x30000, 0x10, false, false, None).unwrap().id;
    let kept = t.cache.obtain_buffer(0x40000, 0x10, false, false, None).unwrap().id;

    t.cache.invalidate_memory(0x30000, 0x4000).unwrap();
    assert!(t.cache.find_buffer(0x30000, 0x10).is_null());
    assert!(t.cache.page_data(0x30000).buffer_id.is_null());
    assert!(!t.cache.is_region_registered(0x30000, 0x4000));
    assert_eq!(t.cache.live_buffers(), vec![(kept, AddrRange::new(0x40000, 0x44000))]);
    assert_ne!(id, kept);

    // Partial coverage keeps the buffer.
    t.cache.invalidate_memory(0x40000, 0x100).unwrap();
    assert_eq!(t.cache.find_buffer(0x40000, 0x10), kept);
}

#[test]
fn invalidation_drops_gpu_state() {
    let t = TestCache::default();
    let _ = t.gpu_write(0x8000, &[9; 0x40]);
    assert!(t.cache.gpu_modified_ranges().contains(AddrRange::new(0x8000, 0x8040)));

    t.cache.invalidate_memory(0x8000, 0x20).unwrap();
    let gpu = t.cache.gpu_modified_ranges();
    assert!(!gpu.intersects(AddrRange::new(0x8000, 0x8020)));
    assert!(gpu.contains(AddrRange::new(0x8020, 0x8040)));
    assert!(!t.cache.is_region_gpu_modified(0x8000, 0x20));
}

#[test]
fn partial_cpu_write_keeps_gpu_bytes_of_the_page() {
    let t = TestCache::default();
    t.cpu_write(0x4000, &[0x11; 0x1000]);
    let slice = t.gpu_write(0x4000, &[0xAA; 0x1000]);

    t.cpu_write(0x4000, &[0x22; 4]);
    t.cache.invalidate_memory(0x4000, 4).unwrap();
    assert!(t.cache.is_region_cpu_modified(0x4000, 4));
    assert!(!t.cache.is_region_gpu_modified(0x4000, 4));
    assert!(t.cache.is_region_gpu_modified(0x4004, 0xFFC));

    // Only the invalidated bytes are uploaded over the GPU data.
    let _ = t.cache.obtain_buffer(0x4000, 0x1000, false, false, None).unwrap();
    let device = t.device_read(&slice, 0x1000);
    assert_eq!(&device[..4], &[0x22; 4][..]);
    assert_eq!(&device[4..], &[0xAA; 0xFFC][..]);

    assert!(t.cache.commit_pending_downloads(true).unwrap());
    t.cache.read_memory(0x4000, 0x1000).unwrap();
    let host = t.cpu_read(0x4000, 0x1000);
    assert_eq!(&host[..4], &[0x22; 4][..]);
    assert_eq!(&host[4..], &[0xAA; 0xFFC][..]);
    assert!(t.cache.gpu_modified_ranges().is_empty());
}

#[test]
fn dma_ranges_are_replayed() {
    let t = TestCache::new(small_config(true));
    let slice = t.cache.obtain_buffer(0x50000, 0x40, false, false, None).unwrap();
    t.cpu_write(0x50000, &[5; 0x40]);
    t.cache.invalidate_memory(0x50000, 0x40).unwrap();
    assert_eq!(t.device_read(&slice, 0x40), vec![0; 0x40]);

    t.cache.synchronize_dma_buffers().unwrap();
    assert_eq!(t.device_read(&slice, 0x40), vec![5; 0x40]);
    assert!(!t.cache.is_region_cpu_modified(0x50000, 0x40));
}
