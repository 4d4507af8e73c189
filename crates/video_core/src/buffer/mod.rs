//! GPU buffer objects and their owners.
//!
//! This module implements everything that owns device memory:
//! 1. **SlotVector:** A slot-indexed arena handing out stable integer ids.
//! 2. **Buffer:** Metadata for one cached device allocation (span, handle, usage, tombstone).
//! 3. **BufferPool:** The arena of cached buffers plus deferred, tick-gated reclamation.
//! 4. **StreamBuffer:** Ring allocators over the four utility buffers.

/// Cached buffer metadata and usage classes.
#[allow(clippy::module_inception)]
pub mod buffer;

/// Slot arena for buffers with deferred reclamation.
pub mod pool;

/// Slot-indexed arena with stable ids.
pub mod slot_vector;

/// Ring allocator over a utility buffer.
pub mod stream_buffer;

pub use buffer::{Buffer, MemoryUsage};
pub use pool::BufferPool;
pub use slot_vector::{SlotId, SlotVector};
pub use stream_buffer::StreamBuffer;

/// Stable identifier of a cached buffer.
pub type BufferId = SlotId;

/// The null buffer id; never refers to a live buffer.
pub const NULL_BUFFER_ID: BufferId = SlotId::NULL;
