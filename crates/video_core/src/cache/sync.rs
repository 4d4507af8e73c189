//! Uploads and transfer commands.
//!
//! Guest bytes reach a cached buffer through a staging span: the upload ring when it has room,
//! otherwise a temporary upload buffer destroyed once the current tick retires. Pages the tracker
//! reports CPU modified are uploaded minus the bytes still GPU modified, and they are marked clean
//! after the copies are recorded.

use tracing::trace;

use super::{BufferCache, BufferSlice, CacheGuard, IndexBufferDesc, VertexInput, request_range};
use crate::buffer::{BufferId, MemoryUsage};
use crate::common::addr::{AddrRange, VAddr};
use crate::common::constants::{INLINE_DATA_ALIGNMENT, STAGING_ALIGNMENT};
use crate::common::error::{CacheError, CacheResult};
use crate::device::{Barrier, BufferCopy, BufferHandle, VertexBinding};
use crate::range::RangeSet;

/// One side of a transfer: a cached buffer or the GDS buffer.
#[derive(Clone, Copy, Debug)]
struct Endpoint {
    handle: BufferHandle,
    offset: u64,
}

impl From<BufferSlice> for Endpoint {
    fn from(slice: BufferSlice) -> Self {
        Self {
            handle: slice.handle,
            offset: slice.offset,
        }
    }
}

impl CacheGuard<'_> {
    /// Maps `size` bytes of the `usage` ring for the current tick, or a temporary buffer.
    fn staging_span(&mut self, usage: MemoryUsage, size: u64) -> CacheResult<(BufferHandle, u64)> {
        let shared = self.shared;
        let device = shared.device.as_ref();
        let tick = device.current_tick();
        let mapped = {
            let mut utility = shared.utility.lock();
            let ring = utility.get_mut(usage);
            ring.map(size, STAGING_ALIGNMENT, tick, |t| device.is_tick_done(t))
                .map(|offset| (ring.handle(), offset))
        };
        if let Some(span) = mapped {
            return Ok(span);
        }
        let buffer = device
            .create_buffer(size, usage)
            .map_err(|err| CacheError::from_alloc(err, usage))?;
        self.pool.defer_destroy(buffer.handle);
        trace!(size, ?usage, "ring full, using temporary buffer");
        Ok((buffer.handle, 0))
    }

    /// Writes `data` into a staging span and returns where it landed.
    fn stage(&mut self, usage: MemoryUsage, data: &[u8]) -> CacheResult<(BufferHandle, u64)> {
        let (handle, offset) = self.staging_span(usage, data.len() as u64)?;
        self.shared.device.write_buffer(handle, offset, data)?;
        Ok((handle, offset))
    }

    /// Uploads the CPU-modified parts of `range` into buffer `id`.
    ///
    /// # Returns
    ///
    /// `true` if any bytes were uploaded.
    pub(crate) fn synchronize_buffer(
        &mut self,
        id: BufferId,
        range: AddrRange,
        is_texel_buffer: bool,
    ) -> CacheResult<bool> {
        let buffer_range = self.pool[id].range();
        let Some(range) = range.intersect(&buffer_range) else {
            return Ok(false);
        };
        let shared = self.shared;
        let memory = shared.memory.as_ref();
        let runs: Vec<AddrRange> = self
            .state
            .memory_tracker
            .upload_ranges(range)
            .iter()
            .filter_map(|run| run.intersect(&buffer_range))
            .filter(|run| memory.is_mapped(run.begin, run.len()))
            .collect();
        // Bytes the GPU wrote are newer than guest memory; pages may mix both.
        let mut pieces: RangeSet = runs.iter().copied().collect();
        for run in &runs {
            for gpu in self.state.gpu_modified_ranges.intersection(*run) {
                pieces.subtract(gpu);
            }
        }

        let mut uploaded = false;
        if !pieces.is_empty() {
            let total = pieces.total_bytes();
            let mut data = vec![0u8; total as usize];
            let mut copies = Vec::with_capacity(pieces.interval_count());
            let mut cursor = 0;
            for piece in pieces.iter() {
                let len = piece.len() as usize;
                memory.read(piece.begin, &mut data[cursor..cursor + len])?;
                copies.push(BufferCopy {
                    src_offset: cursor as u64,
                    dst_offset: self.pool[id].offset(piece.begin),
                    size: piece.len(),
                });
                cursor += len;
            }

            let (staging, base) = self.stage(MemoryUsage::Upload, &data)?;
            for copy in &mut copies {
                copy.src_offset += base;
            }
            let device = shared.device.as_ref();
            device.barrier(Barrier::ShaderToTransfer);
            device.copy_buffer(staging, self.pool[id].handle(), &copies)?;
            device.barrier(Barrier::TransferToShader);

            self.state.stats.uploads += 1;
            self.state.stats.upload_bytes += total;
            trace!(%id, pieces = copies.len(), bytes = total, "buffer uploaded");
            uploaded = true;
        }
        if !runs.is_empty() {
            self.state.memory_tracker.clear_cpu_modified(&runs);
        }

        if is_texel_buffer {
            uploaded |= self.synchronize_buffer_from_image(id, range);
        }
        Ok(uploaded)
    }

    /// Lets the texture cache overwrite `range` of buffer `id` with newer image data.
    fn synchronize_buffer_from_image(&mut self, id: BufferId, range: AddrRange) -> bool {
        let buffer = &self.pool[id];
        let copied = self.shared.texture_cache.copy_to_buffer(
            range.begin,
            range.len(),
            buffer.handle(),
            buffer.offset(range.begin),
        );
        if copied {
            self.state.stats.image_copies += 1;
        }
        copied
    }

    /// Uploads every buffer intersecting `range`, clipped to it.
    pub(crate) fn synchronize_range(&mut self, range: AddrRange) -> CacheResult<()> {
        let mut ids = Vec::new();
        self.for_each_buffer_in_range(range, |id, _| ids.push(id));
        for id in ids {
            let _ = self.synchronize_buffer(id, range, false)?;
        }
        Ok(())
    }

    /// Drops GPU-write bookkeeping for `range` after both copies were made equal.
    fn forget_gpu_writes(&mut self, range: AddrRange) {
        let state = &mut *self.state;
        state.gpu_modified_ranges.subtract(range);
        state.pending_download_ranges.subtract(range);
        state.rewritten_ranges.subtract(range);
        state.download_owners.subtract(range);
        state.release_gpu_pages(range);
    }

    /// Resolves a GDS transfer endpoint.
    fn gds_endpoint(&self, offset: u64, size: u64) -> CacheResult<Endpoint> {
        let gds_size = self.shared.config.general.gds_size;
        if offset.checked_add(size).is_none_or(|end| end > gds_size) {
            return Err(CacheError::GdsOutOfRange {
                offset,
                size,
                gds_size,
            });
        }
        Ok(Endpoint {
            handle: self.shared.fixed.gds.handle(),
            offset,
        })
    }
}

impl BufferCache {
    /// Uploads the CPU-modified parts of every buffer intersecting the range.
    pub fn synchronize_buffers_in_range(&self, device_addr: VAddr, size: u64) -> CacheResult<()> {
        let range = request_range(device_addr, size)?;
        self.shared.lock().synchronize_range(range)
    }

    /// Replays CPU writes to registered memory recorded while BDA tracking is enabled.
    ///
    /// Buffers reached through raw device addresses are never obtained, so their uploads happen
    /// here instead of on the obtain path.
    pub fn synchronize_dma_buffers(&self) -> CacheResult<()> {
        let mut guard = self.shared.lock();
        let ranges = std::mem::take(&mut guard.state.dma_sync_ranges);
        for range in ranges.iter() {
            guard.synchronize_range(range)?;
        }
        trace!(ranges = ranges.interval_count(), "dma buffers synchronized");
        Ok(())
    }

    /// Writes `data` at `address` as a command-stream write.
    ///
    /// # Arguments
    ///
    /// * `address` - Guest address, or GDS offset when `is_gds`; must be dword aligned.
    /// * `data` - Bytes to write.
    /// * `is_gds` - Target the global data share instead of guest memory.
    ///
    /// Guest memory is always written. Cached buffers over the range receive the same bytes,
    /// and pending downloads no longer write back over them.
    pub fn inline_data(&self, address: VAddr, data: &[u8], is_gds: bool) -> CacheResult<()> {
        if address % INLINE_DATA_ALIGNMENT != 0 {
            return Err(CacheError::Misaligned(address));
        }
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;

        if is_gds {
            let mut guard = self.shared.lock();
            let dst = guard.gds_endpoint(address, size)?;
            let (staging, offset) = guard.stage(MemoryUsage::Stream, data)?;
            let device = self.shared.device.as_ref();
            device.copy_buffer(
                staging,
                dst.handle,
                &[BufferCopy {
                    src_offset: offset,
                    dst_offset: dst.offset,
                    size,
                }],
            )?;
            device.barrier(Barrier::TransferToShader);
            return Ok(());
        }

        let range = request_range(address, size)?;
        self.shared.memory.write(address, data)?;
        if !self.is_region_registered(address, size) {
            return Ok(());
        }

        let mut guard = self.shared.lock();
        let mut targets = Vec::new();
        guard.for_each_buffer_in_range(range, |_, buffer| {
            if let Some(clip) = buffer.range().intersect(&range) {
                targets.push((buffer.handle(), buffer.offset(clip.begin), clip));
            }
        });
        let (staging, base) = guard.stage(MemoryUsage::Stream, data)?;
        let device = self.shared.device.as_ref();
        device.barrier(Barrier::ShaderToTransfer);
        for (handle, dst_offset, clip) in targets {
            device.copy_buffer(
                staging,
                handle,
                &[BufferCopy {
                    src_offset: base + (clip.begin - range.begin),
                    dst_offset,
                    size: clip.len(),
                }],
            )?;
        }
        device.barrier(Barrier::TransferToShader);
        guard.forget_gpu_writes(range);
        Ok(())
    }

    /// Copies `num_bytes` from `src` to `dst`.
    ///
    /// When neither side holds GPU data the copy happens in guest memory and the destination
    /// pages become CPU modified. Otherwise both ranges are obtained and the copy is recorded on
    /// the device, making `dst` GPU modified. GDS endpoints are offsets into the GDS buffer.
    pub fn copy_buffer(
        &self,
        dst: VAddr,
        src: VAddr,
        num_bytes: u64,
        dst_gds: bool,
        src_gds: bool,
    ) -> CacheResult<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        let dst_range = (!dst_gds).then(|| request_range(dst, num_bytes)).transpose()?;
        let src_range = (!src_gds).then(|| request_range(src, num_bytes)).transpose()?;

        if let (Some(dst_range), Some(src_range)) = (dst_range, src_range)
            && !self.is_region_gpu_modified(dst, num_bytes)
            && !self.is_region_gpu_modified(src, num_bytes)
        {
            self.shared.memory.copy(dst, src, num_bytes)?;
            let mut guard = self.shared.lock();
            guard.state.memory_tracker.mark_region_as_cpu_modified(dst_range);
            trace!(%dst_range, %src_range, "copy done in guest memory");
            return Ok(());
        }

        let mut guard = self.shared.lock();
        let src_slice = match src_range {
            Some(range) => Some(guard.obtain(range, false, false, None)?),
            None => None,
        };
        let dst_end = match dst_range {
            Some(range) => guard.obtain(range, true, false, None)?.into(),
            None => guard.gds_endpoint(dst, num_bytes)?,
        };
        // Obtaining the destination may have absorbed the source buffer.
        let src_end = match (src_range, src_slice) {
            (Some(range), Some(slice)) => {
                let id = guard.find_buffer(range);
                if id == slice.id {
                    slice.into()
                } else if id.is_null() {
                    guard.obtain(range, false, false, None)?.into()
                } else {
                    BufferSlice::new(id, &guard.pool[id], range.begin).into()
                }
            }
            _ => guard.gds_endpoint(src, num_bytes)?,
        };

        let device = self.shared.device.as_ref();
        device.barrier(Barrier::ShaderToTransfer);
        let src_span = src_end.offset..src_end.offset + num_bytes;
        let dst_span = dst_end.offset..dst_end.offset + num_bytes;
        if src_end.handle == dst_end.handle
            && src_span.start < dst_span.end
            && dst_span.start < src_span.end
        {
            let (scratch, base) = guard.staging_span(MemoryUsage::DeviceLocal, num_bytes)?;
            device.copy_buffer(
                src_end.handle,
                scratch,
                &[BufferCopy {
                    src_offset: src_end.offset,
                    dst_offset: base,
                    size: num_bytes,
                }],
            )?;
            device.copy_buffer(
                scratch,
                dst_end.handle,
                &[BufferCopy {
                    src_offset: base,
                    dst_offset: dst_end.offset,
                    size: num_bytes,
                }],
            )?;
        } else {
            device.copy_buffer(
                src_end.handle,
                dst_end.handle,
                &[BufferCopy {
                    src_offset: src_end.offset,
                    dst_offset: dst_end.offset,
                    size: num_bytes,
                }],
            )?;
        }
        device.barrier(Barrier::TransferToShader);
        trace!(dst, src, num_bytes, dst_gds, src_gds, "copy recorded on device");
        Ok(())
    }

    /// Obtains and binds the vertex buffers of a draw.
    ///
    /// Overlapping and adjacent inputs are merged so each merged range is obtained once. Inputs
    /// with a zero size stay unbound.
    pub fn bind_vertex_buffers(&self, inputs: &[VertexInput]) -> CacheResult<()> {
        let mut ranges = Vec::with_capacity(inputs.len());
        for input in inputs.iter().filter(|input| input.size > 0) {
            ranges.push((input, request_range(input.base_address, input.size)?));
        }
        let merged: RangeSet = ranges.iter().map(|(_, range)| *range).collect();

        let mut guard = self.shared.lock();
        for range in merged.iter() {
            let _ = guard.obtain(range, false, false, None)?;
        }
        // Later obtains may have merged buffers obtained earlier.
        let mut bindings = Vec::with_capacity(ranges.len());
        for (input, range) in ranges {
            let id = guard.find_buffer(range);
            debug_assert!(!id.is_null(), "vertex input {range} lost its buffer");
            if id.is_null() {
                continue;
            }
            let buffer = &guard.pool[id];
            bindings.push(VertexBinding {
                binding: input.binding,
                handle: buffer.handle(),
                offset: buffer.offset(range.begin),
                size: range.len(),
                stride: input.stride,
            });
        }
        self.shared.device.bind_vertex_buffers(&bindings);
        trace!(merged = merged.interval_count(), bound = bindings.len(), "vertex buffers bound");
        Ok(())
    }

    /// Obtains and binds the index buffer of a draw.
    ///
    /// # Arguments
    ///
    /// * `desc` - Index buffer address, count and width.
    /// * `index_offset` - First index drawn; the bound range starts at that index.
    pub fn bind_index_buffer(&self, desc: IndexBufferDesc, index_offset: u32) -> CacheResult<()> {
        let stride = desc.index_type.size_bytes();
        let size = u64::from(desc.num_indices) * stride;
        let address = desc
            .base_address
            .checked_add(u64::from(index_offset) * stride)
            .ok_or(CacheError::AddressOutOfRange { addr: desc.base_address, size })?;
        let range = request_range(address, size)?;
        let slice = self.shared.lock().obtain(range, false, false, None)?;
        self.shared
            .device
            .bind_index_buffer(slice.handle, slice.offset, desc.index_type);
        Ok(())
    }
}
