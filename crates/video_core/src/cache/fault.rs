//! Fault-buffer processing.
//!
//! Shaders reaching memory through buffer device addresses look pages up in the BDA page table.
//! A lookup that finds no buffer sets the page's bit in the fault buffer. Processing is explicit:
//! the caller runs it between submissions, the device scans the bits into a page list, and a
//! buffer is created over every faulting page that is still unbacked.

use tracing::{debug, instrument};

use super::BufferCache;
use crate::buffer::MemoryUsage;
use crate::common::addr::AddrRange;
use crate::common::constants::{CACHING_PAGEBITS, CACHING_PAGESIZE};
use crate::common::error::{CacheError, CacheResult};
use crate::device::{Barrier, FAULT_SCAN_LIST_OFFSET};
use crate::range::RangeSet;

/// Bytes per page index in the scan output.
const PAGE_INDEX_SIZE: u64 = 8;

impl BufferCache {
    /// Creates buffers for every page recorded in the fault buffer and clears the recorded bits.
    ///
    /// At most `max_page_faults` pages are collected per call; remaining bits stay set for the
    /// next call. Blocks until the scan finishes on the device, without holding cache locks.
    ///
    /// # Returns
    ///
    /// The number of faulting pages collected, or `CacheError::BdaDisabled` when BDA tracking is
    /// off.
    #[instrument(skip(self), level = "debug")]
    pub fn process_fault_buffer(&self) -> CacheResult<usize> {
        let Some(fault) = self.shared.fixed.fault.as_ref() else {
            return Err(CacheError::BdaDisabled);
        };
        let device = self.shared.device.as_ref();
        let max_faults = self.shared.config.general.max_page_faults;
        let output_size = FAULT_SCAN_LIST_OFFSET + u64::from(max_faults) * PAGE_INDEX_SIZE;

        // The download ring is gated on download ticks, which the scan does not advance.
        let usage = MemoryUsage::Download;
        let output = device
            .create_buffer(output_size, usage)
            .map_err(|err| CacheError::from_alloc(err, usage))?
            .handle;

        let scanned = device
            .scan_fault_buffer(fault.handle(), output, 0, max_faults)
            .map(|()| {
                device.barrier(Barrier::TransferToHost);
                device.wait_tick(device.flush());
            })
            .and_then(|()| {
                let mut count = [0u8; 4];
                device.read_buffer(output, 0, &mut count)?;
                let count = u32::from_le_bytes(count).min(max_faults) as usize;
                let mut list = vec![0u8; count * PAGE_INDEX_SIZE as usize];
                device.read_buffer(output, FAULT_SCAN_LIST_OFFSET, &mut list)?;
                Ok(list)
            });
        device.destroy_buffer(output);
        let list = scanned?;

        let pages: RangeSet = list
            .chunks_exact(PAGE_INDEX_SIZE as usize)
            .filter_map(|bytes| <[u8; 8]>::try_from(bytes).ok())
            .map(|bytes| {
                let page = u64::from_le_bytes(bytes);
                AddrRange::from_size(page << CACHING_PAGEBITS, CACHING_PAGESIZE)
            })
            .collect();
        let faults = list.len() / PAGE_INDEX_SIZE as usize;

        let mut guard = self.shared.lock();
        let mut created = 0;
        for range in pages.iter() {
            if guard.find_buffer(range).is_null() {
                let _ = guard.create_buffer(range)?;
                created += 1;
            }
            guard.synchronize_range(range)?;
        }
        guard.state.stats.faults_processed += faults as u64;
        drop(guard);
        debug!(faults, created, "fault buffer processed");
        Ok(faults)
    }

    /// Records a full memory barrier ordering buffer device address writes before later reads.
    pub fn memory_barrier(&self) {
        self.shared.device.barrier(Barrier::Memory);
    }
}
