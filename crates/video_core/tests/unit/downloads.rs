//! # Download Tests
//!
//! Commit scheduling, worker ordering, write-back ownership and read waits.
//! Tests holding device completion release it before the cache is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use gpucache_core::common::AddrRange;
use gpucache_core::device::HostDevice;
use gpucache_core::traits::{NullPageWatcher, NullTextureCache};
use pretty_assertions::assert_eq;
use std::sync::Arc;

use crate::common::harness::{TestCache, small_config};

fn held() -> TestCache {
    let device = HostDevice::new();
    device.hold_completion();
    TestCache::build(
        small_config(false),
        device,
        Arc::new(NullPageWatcher),
        Arc::new(NullTextureCache),
    )
}

// ══════════════════════════════════════════════════════════
// 1. Commit and write-back
// ══════════════════════════════════════════════════════════

#[test]
fn gpu_writes_reach_guest_memory() {
    let t = TestCache::default();
    let pattern: Vec<u8> = (0..64).map(|i| i * 3).collect();
    let _ = t.gpu_write(0x8000, &pattern);
    assert_eq!(t.cache.pending_download_ranges().total_bytes(), 0);

    assert!(t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cpu_read(0x8000, 64), pattern);
    assert!(t.cache.gpu_modified_ranges().is_empty());
    assert!(t.cache.pending_download_ranges().is_empty());
    assert!(!t.cache.is_region_gpu_modified(0x8000, 64));
    assert_eq!(t.cache.download_tick(), 1);

    let stats = t.cache.stats();
    assert_eq!(stats.downloads_scheduled, 1);
    assert_eq!(stats.downloads_completed, 1);
    assert_eq!(stats.download_bytes, 64);
}

#[test]
fn only_gpu_modified_bytes_are_written_back() {
    let t = TestCache::default();
    t.cpu_write(0x8000, &[0x11; 0x100]);
    let slice = t.cache.obtain_buffer(0x8000, 0x100, false, false, None).unwrap();
    // Scribble over the whole buffer range but only declare the middle written.
    t.device_write(&slice, &[0xEE; 0x100]);
    let _ = t.gpu_write(0x8040, &[0x22; 0x40]);

    assert!(t.cache.commit_pending_downloads(true).unwrap());
    let host = t.cpu_read(0x8000, 0x100);
    assert_eq!(&host[..0x40], &[0x11; 0x40][..]);
    assert_eq!(&host[0x40..0x80], &[0x22; 0x40][..]);
    assert_eq!(&host[0x80..], &[0x11; 0x80][..]);
}

#[test]
fn commit_without_new_writes_does_nothing() {
    let t = TestCache::default();
    assert!(!t.cache.commit_pending_downloads(false).unwrap());

    let _ = t.gpu_write(0x8000, &[1; 16]);
    assert!(t.cache.commit_pending_downloads(true).unwrap());
    assert!(!t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cache.stats().downloads_scheduled, 1);
}

#[test]
fn scheduled_ranges_are_not_scheduled_twice() {
    let t = held();
    let _ = t.gpu_write(0x8000, &[1; 16]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    assert_eq!(
        t.cache.pending_download_ranges().iter().collect::<Vec<_>>(),
        vec![AddrRange::new(0x8000, 0x8010)]
    );
    assert_eq!(t.cache.page_data(0x8000).target_tick, 1);
    assert!(!t.cache.commit_pending_downloads(false).unwrap());

    t.device.release_completion();
    t.cache.read_memory(0x8000, 16).unwrap();
    assert_eq!(t.cpu_read(0x8000, 16), vec![1; 16]);
}

#[test]
fn read_after_waited_commit_does_not_block() {
    let t = TestCache::default();
    let _ = t.gpu_write(0x8000, &[4; 32]);
    assert!(t.cache.commit_pending_downloads(true).unwrap());

    t.cache.read_memory(0x8000, 32).unwrap();
    assert_eq!(t.cache.stats().read_waits, 0);
}

#[test]
fn untouched_pages_never_wait() {
    let t = held();
    t.cache.read_memory(0x8000, 0x100).unwrap();
    assert_eq!(t.cache.stats().read_waits, 0);
    t.device.release_completion();
}

// ══════════════════════════════════════════════════════════
// 2. Worker ordering and blocking
// ══════════════════════════════════════════════════════════

#[test]
fn read_memory_blocks_until_download_lands() {
    let t = held();
    let _ = t.gpu_write(0x8000, &[6; 32]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let reader = s.spawn(|| {
            t.cache.read_memory(0x8000, 32).unwrap();
            done.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        t.device.complete_through(u64::MAX);
        reader.join().unwrap();
    });

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(t.cpu_read(0x8000, 32), vec![6; 32]);
    assert_eq!(t.cache.stats().read_waits, 1);
    t.device.release_completion();
}

#[test]
fn downloads_complete_in_commit_order() {
    let t = held();
    let _ = t.gpu_write(0x10000, &[0xA; 16]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    let first = t.last_submitted();
    let _ = t.gpu_write(0x40000, &[0xB; 16]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    let second = t.last_submitted();
    assert!(first < second);
    assert_eq!(t.cache.download_tick(), 0);

    t.device.complete_through(first);
    t.cache.read_memory(0x10000, 16).unwrap();
    assert_eq!(t.cache.download_tick(), 1);
    assert_eq!(t.cpu_read(0x10000, 16), vec![0xA; 16]);
    assert_eq!(t.cpu_read(0x40000, 16), vec![0; 16]);
    assert_eq!(t.cache.stats().downloads_completed, 1);

    t.device.complete_through(second);
    t.cache.read_memory(0x40000, 16).unwrap();
    assert_eq!(t.cache.download_tick(), 2);
    assert_eq!(t.cpu_read(0x40000, 16), vec![0xB; 16]);
    assert_eq!(t.cache.stats().downloads_completed, 2);
    t.device.release_completion();
}

#[test]
fn rewritten_ranges_are_downloaded_by_the_latest_commit() {
    let t = held();
    let _ = t.gpu_write(0x8000, &[0xAA; 32]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    let _ = t.gpu_write(0x8000, &[0xBB; 32]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    assert_eq!(t.cache.page_data(0x8000).target_tick, 2);

    t.device.release_completion();
    t.cache.read_memory(0x8000, 32).unwrap();
    assert_eq!(t.cpu_read(0x8000, 32), vec![0xBB; 32]);
    assert!(t.cache.gpu_modified_ranges().is_empty());
    assert!(t.cache.pending_download_ranges().is_empty());
}

#[test]
fn gpu_write_after_commit_keeps_range_dirty() {
    let t = held();
    let _ = t.gpu_write(0x8000, &[0xAA; 32]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());
    let _ = t.gpu_write(0x8000, &[0xBB; 32]);

    t.device.release_completion();
    t.cache.read_memory(0x8000, 32).unwrap();
    assert_eq!(t.cpu_read(0x8000, 32), vec![0xAA; 32]);
    assert!(t.cache.gpu_modified_ranges().contains(AddrRange::new(0x8000, 0x8020)));
    assert!(t.cache.is_region_gpu_modified(0x8000, 32));

    assert!(t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cpu_read(0x8000, 32), vec![0xBB; 32]);
}

#[test]
fn cpu_write_during_download_wins() {
    let t = held();
    let _ = t.gpu_write(0x8000, &[0xAA; 32]);
    assert!(t.cache.commit_pending_downloads(false).unwrap());

    t.cpu_write(0x8000, &[0x11; 32]);
    t.cache.invalidate_memory(0x8000, 32).unwrap();
    assert!(t.cache.pending_download_ranges().is_empty());

    t.device.release_completion();
    t.cache.read_memory(0x8000, 32).unwrap();
    assert_eq!(t.cache.download_tick(), 1);
    assert_eq!(t.cpu_read(0x8000, 32), vec![0x11; 32]);
}
