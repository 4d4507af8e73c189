//! # Transfer Tests
//!
//! Inline data, buffer-to-buffer copies and vertex/index binding.

use gpucache_core::CacheError;
use gpucache_core::cache::{IndexBufferDesc, VertexInput};
use gpucache_core::common::AddrRange;
use gpucache_core::device::{Device, IndexType};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::common::harness::TestCache;

fn gds_read(t: &TestCache, offset: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    t.device
        .read_buffer(t.cache.gds_buffer().handle(), offset, &mut out)
        .unwrap();
    out
}

// ══════════════════════════════════════════════════════════
// 1. Inline data
// ══════════════════════════════════════════════════════════

#[test]
fn inline_data_to_unregistered_memory_only_touches_guest() {
    let t = TestCache::default();
    t.cache.inline_data(0x60000, &[1, 2, 3, 4], false).unwrap();
    assert_eq!(t.cpu_read(0x60000, 4), vec![1, 2, 3, 4]);
    assert_eq!(t.cache.live_buffer_count(), 0);
}

#[test]
fn inline_data_updates_registered_buffers() {
    let t = TestCache::default();
    let slice = t.cache.obtain_buffer(0x60000, 0x40, false, false, None).unwrap();
    t.cache.inline_data(0x60010, &[9; 8], false).unwrap();

    assert_eq!(t.cpu_read(0x60010, 8), vec![9; 8]);
    let device = t.device_read(&slice, 0x20);
    assert_eq!(&device[0x10..0x18], &[9; 8][..]);
    assert_eq!(&device[..0x10], &[0; 0x10][..]);
}

#[test]
fn inline_data_supersedes_pending_gpu_bytes() {
    let t = TestCache::default();
    let _ = t.gpu_write(0x60000, &[0xAA; 0x20]);
    t.cache.inline_data(0x60000, &[0x55; 0x20], false).unwrap();
    assert!(!t.cache.gpu_modified_ranges().intersects(AddrRange::new(0x60000, 0x60020)));
    assert!(!t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cpu_read(0x60000, 0x20), vec![0x55; 0x20]);
}

#[test]
fn inline_data_to_gds() {
    let t = TestCache::default();
    t.cache.inline_data(0x10, &[5; 4], true).unwrap();
    assert_eq!(gds_read(&t, 0x10, 4), vec![5; 4]);
    assert_eq!(t.cpu_read(0x10, 4), vec![0; 4]);
}

#[rstest]
#[case(0x61002, false)]
#[case(0x6, true)]
fn inline_data_must_be_dword_aligned(#[case] address: u64, #[case] is_gds: bool) {
    let t = TestCache::default();
    let err = t.cache.inline_data(address, &[1; 4], is_gds).unwrap_err();
    assert!(matches!(err, CacheError::Misaligned(addr) if addr == address));
}

#[test]
fn inline_data_past_gds_fails() {
    let t = TestCache::default();
    let gds_size = t.cache.config().general.gds_size;
    let err = t.cache.inline_data(gds_size - 4, &[1; 8], true).unwrap_err();
    assert!(matches!(err, CacheError::GdsOutOfRange { offset, size: 8, .. } if offset == gds_size - 4));
}

// ══════════════════════════════════════════════════════════
// 2. Buffer copies
// ══════════════════════════════════════════════════════════

#[test]
fn cpu_only_copy_stays_in_guest_memory() {
    let t = TestCache::default();
    let pattern: Vec<u8> = (0..32).collect();
    t.cpu_write(0x70000, &pattern);
    let copies = t.device.copy_count();

    t.cache.copy_buffer(0x78000, 0x70000, 32, false, false).unwrap();
    assert_eq!(t.cpu_read(0x78000, 32), pattern);
    assert_eq!(t.device.copy_count(), copies);
    assert_eq!(t.cache.live_buffer_count(), 0);
}

#[test]
fn copy_from_gpu_data_is_recorded_on_device() {
    let t = TestCache::default();
    let pattern: Vec<u8> = (100..164).collect();
    let _ = t.gpu_write(0x70000, &pattern);

    t.cache.copy_buffer(0x90000, 0x70000, 64, false, false).unwrap();
    assert!(t.cache.gpu_modified_ranges().contains(AddrRange::new(0x90000, 0x90040)));
    let dst = t.cache.obtain_buffer(0x90000, 64, false, false, None).unwrap();
    assert_eq!(t.device_read(&dst, 64), pattern);

    assert!(t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cpu_read(0x90000, 64), pattern);
}

#[test]
fn overlapping_copy_within_one_buffer() {
    let t = TestCache::default();
    let pattern: Vec<u8> = (0..64).collect();
    let src = t.gpu_write(0x70000, &pattern);

    t.cache.copy_buffer(0x70020, 0x70000, 64, false, false).unwrap();
    let dst = t.cache.obtain_buffer(0x70020, 64, false, false, None).unwrap();
    assert_eq!(dst.id, src.id);
    assert_eq!(t.device_read(&dst, 64), pattern);
}

#[test]
fn copy_between_gds_and_memory() {
    let t = TestCache::default();
    t.cache.inline_data(0x100, &[7; 16], true).unwrap();

    t.cache.copy_buffer(0x80000, 0x100, 16, false, true).unwrap();
    assert!(t.cache.is_region_gpu_modified(0x80000, 16));
    assert!(t.cache.commit_pending_downloads(true).unwrap());
    assert_eq!(t.cpu_read(0x80000, 16), vec![7; 16]);

    t.cache.copy_buffer(0x200, 0x80000, 16, true, false).unwrap();
    assert_eq!(gds_read(&t, 0x200, 16), vec![7; 16]);
}

// ══════════════════════════════════════════════════════════
// 3. Draw bindings
// ══════════════════════════════════════════════════════════

#[test]
fn vertex_inputs_share_a_merged_buffer() {
    let t = TestCache::default();
    let inputs = [
        VertexInput {
            binding: 0,
            base_address: 0x90000,
            size: 0x100,
            stride: 16,
        },
        VertexInput {
            binding: 1,
            base_address: 0x90080,
            size: 0x100,
            stride: 12,
        },
        VertexInput {
            binding: 2,
            base_address: 0xA0000,
            size: 0,
            stride: 4,
        },
    ];
    t.cache.bind_vertex_buffers(&inputs).unwrap();

    let bindings = t.device.vertex_bindings();
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].binding, 0);
    assert_eq!(bindings[1].binding, 1);
    assert_eq!(bindings[0].handle, bindings[1].handle);
    assert_eq!(bindings[1].offset - bindings[0].offset, 0x80);
    assert_eq!(bindings[1].size, 0x100);
    assert_eq!(bindings[1].stride, 12);
    assert_eq!(t.cache.live_buffer_count(), 1);
}

#[test]
fn vertex_inputs_see_merges_from_later_inputs() {
    let t = TestCache::default();
    let inputs = [
        VertexInput {
            binding: 0,
            base_address: 0x91000,
            size: 0x100,
            stride: 16,
        },
        VertexInput {
            binding: 1,
            base_address: 0x93f00,
            size: 0x200,
            stride: 16,
        },
    ];
    t.cache.bind_vertex_buffers(&inputs).unwrap();

    let bindings = t.device.vertex_bindings();
    let live = t.cache.live_buffers();
    assert_eq!(live.len(), 1);
    let id = live[0].0;
    assert!(bindings.iter().all(|b| b.handle == t.cache.buffer(id).handle()));
}

#[rstest]
#[case(IndexType::U16, 2)]
#[case(IndexType::U32, 4)]
fn index_buffer_starts_at_index_offset(#[case] index_type: IndexType, #[case] stride: u64) {
    let t = TestCache::default();
    let desc = IndexBufferDesc {
        base_address: 0xA0000,
        num_indices: 6,
        index_type,
    };
    t.cache.bind_index_buffer(desc, 2).unwrap();

    let id = t.cache.find_buffer(0xA0000 + 2 * stride, 6 * stride);
    assert!(!id.is_null());
    let buffer = t.cache.buffer(id);
    assert_eq!(
        t.device.index_binding(),
        Some((buffer.handle(), buffer.offset(0xA0000 + 2 * stride), index_type))
    );
}

#[test]
fn index_buffer_past_the_address_space_is_rejected() {
    let t = TestCache::default();
    let desc = IndexBufferDesc {
        base_address: u64::MAX - 2,
        num_indices: 3,
        index_type: IndexType::U32,
    };
    let err = t.cache.bind_index_buffer(desc, 4).unwrap_err();
    assert!(matches!(err, CacheError::AddressOutOfRange { addr, size: 12 } if addr == u64::MAX - 2));
    assert_eq!(t.device.index_binding(), None);
    assert!(t.cache.live_buffers().is_empty());
}
