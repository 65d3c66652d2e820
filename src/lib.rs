//! GPU resource arenas: sub-allocated, growable device buffers, a shared staging ring for uploads,
//! a transfer scheduler that batches uploads into one submission per flush, image layout tracking
//! and shelf-packed texture atlases.
//!
//! Everything hangs off an [ArenaContext]. Writes made through a [Reference], an [Image] or an
//! [AtlasPool] are only recorded; nothing reaches the device until [ArenaContext::flush] is called.

pub mod config;
pub mod context;
pub mod device;
pub mod event;
pub mod image;
pub mod memory;
pub mod transfer;

pub use crate::config::{ArenaConfig, ConfigError, ARENA_CONFIG_FILENAME};
pub use crate::context::{ArenaContext, ArenaError};
pub use crate::device::{DeviceError, DeviceLimits, GpuDevice, HeadlessDevice};
pub use crate::event::{Event, SubscriberId};
pub use crate::image::{AtlasConfig, AtlasError, AtlasPool, Image, SubImage};
pub use crate::memory::{GrowableBuffer, GrowthMode, PoolDesc, Reference, SharedReference, StagingArena};
pub use crate::transfer::{FlushOutcome, FlushStats, TransferError, TransferScheduler};
