//! Memory management types.
//!
//! # Overview
//!
//! tl;dr - make a [GrowableBuffer], `allocate` typed [Reference]s from it, write through them, and
//! call `flush` on the context once per frame.
//!
//! The memory management hierarchy is as follows:
//!
//! ## Blocks
//!
//! The lowest level is a device buffer object. Creating one goes through the driver and is slow,
//! so pools create few of them and carve them up on the CPU. Each block is fronted by a
//! [RangeAllocator], which tracks which byte ranges of the block are handed out. It's first-fit,
//! and freed ranges are only merged back together when something fails to fit or when the pool is
//! compacted.
//!
//! ## Pools
//!
//! A pool owns the blocks of one kind of memory. [GrowableBuffer] pools are device-local and grow
//! in one of two ways ([GrowthMode]):
//!
//! - `Append`: add another block. Existing references stay where they are. Blocks other than the
//!   newest are retired once they're drained, and destroyed after the next flush.
//! - `Replace`: swap the pool's only block for a bigger one and schedule a copy of the live data.
//!   References look their buffer up every time they're used, so they follow along.
//!
//! The [StagingArena] is an append-mode pool over host-visible, persistently mapped memory. There is
//! one per context, and every upload passes through it.
//!
//! ## References
//!
//! A [Reference] is a typed range in a pool. It doesn't own GPU memory, only the range: dropping
//! it hands the range back. Writes (`update`, `update_with`, `zero`) copy into fresh staging memory
//! right away and enqueue a transfer job, so nothing touches the device until the next flush.
//!
//! ## Locking
//!
//! Each pool has one mutex, the staging arena has its own, and so does the transfer scheduler.
//! They're always taken in that order: a pool may enqueue transfers while holding its lock, but
//! transfer jobs never reach back into a pool while they record.

pub mod growable;
pub mod reference;
pub mod staging;
pub mod suballocator;

pub use self::growable::{GrowableBuffer, GrowthMode, PoolDesc, PoolStats};
pub use self::reference::{BufferBinding, Reference, SharedReference, StagingWindow};
pub use self::staging::{StagingArena, StagingHandle};
pub use self::suballocator::RangeAllocator;
