//! Host-visible upload memory.
//!
//! The [StagingArena] is an append-mode pool over persistently mapped buffers. Every write to a
//! device-local resource goes through here first: allocate a [StagingHandle], copy bytes into it,
//! then hand it to a transfer job whose post-flush cleanup drops it.

use std::ptr::NonNull;
use std::sync::Arc;

use super::growable::{GrowthMode, PoolCore, PoolStats};
use crate::context::ArenaError;
use crate::device::{BufferId, BufferUsage, GpuDevice, MemoryLocation};
use crate::transfer::TransferScheduler;

#[derive(Clone)]
pub struct StagingArena {
	core: Arc<PoolCore>,
}

impl StagingArena {
	/// Maps the first block right away. More blocks are added `block_size` bytes at a time (or
	/// bigger, for big uploads).
	pub fn new(
		device: Arc<dyn GpuDevice>,
		scheduler: Arc<TransferScheduler>,
		block_size: u64,
	) -> Result<Self, ArenaError> {
		let core = Arc::new(PoolCore::new(
			device,
			scheduler,
			"staging",
			BufferUsage::staging(),
			MemoryLocation::HostVisible,
			GrowthMode::Append,
			block_size,
		));
		core.reserve_initial()?;
		Ok(StagingArena { core })
	}

	/// Reserves `size` writable bytes. The offset is aligned to at least the device's copy alignment.
	pub fn allocate(&self, size: usize, align: u64) -> Result<StagingHandle, ArenaError> {
		let allocation = self.core.alloc(size as u64, align.max(self.core.copy_alignment()))?;
		let ptr = allocation
			.mapped
			.expect("staging arena handed out memory that isn't mapped");
		Ok(StagingHandle {
			core: self.core.clone(),
			block: allocation.block,
			buffer: allocation.buffer,
			offset: allocation.offset,
			size,
			ptr,
		})
	}

	/// Merges free ranges and retires drained blocks. Run after every completed flush.
	pub fn compact(&self) {
		self.core.compact();
	}

	pub fn stats(&self) -> PoolStats {
		self.core.stats()
	}
}

/// A range of mapped staging memory. The range goes back to the arena when this is dropped.
///
/// Transfer jobs must not drop a handle while recording; pass it to
/// [Recorder::after_completion](crate::transfer::Recorder::after_completion) instead.
pub struct StagingHandle {
	core: Arc<PoolCore>,
	block: usize,
	buffer: BufferId,
	offset: u64,
	size: usize,
	ptr: NonNull<u8>,
}

// Each handle owns a disjoint range of a mapping that outlives it.
unsafe impl Send for StagingHandle {}
unsafe impl Sync for StagingHandle {}

impl StagingHandle {
	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
	}

	/// The staging buffer this range lives in.
	pub fn buffer(&self) -> BufferId {
		self.buffer
	}

	pub fn offset(&self) -> u64 {
		self.offset
	}

	pub fn len(&self) -> usize {
		self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}
}

impl Drop for StagingHandle {
	fn drop(&mut self) {
		self.core.free(self.block, self.offset);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::HeadlessDevice;

	fn arena(block_size: u64) -> StagingArena {
		let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
		let scheduler = Arc::new(TransferScheduler::new(device.clone(), false));
		StagingArena::new(device, scheduler, block_size).unwrap()
	}

	#[test]
	fn handles_are_writable_and_aligned() {
		let arena = arena(256);
		let mut a = arena.allocate(10, 4).unwrap();
		let mut b = arena.allocate(10, 16).unwrap();
		assert_eq!(a.offset() % 4, 0);
		assert_eq!(b.offset() % 16, 0);
		a.as_mut_slice().copy_from_slice(&[1; 10]);
		b.as_mut_slice().copy_from_slice(&[2; 10]);
		assert_eq!(a.as_slice(), &[1; 10]);
		assert_eq!(b.as_slice(), &[2; 10]);
		assert_eq!(a.buffer(), b.buffer());
	}

	#[test]
	fn dropping_a_handle_frees_its_range() {
		let arena = arena(64);
		let a = arena.allocate(64, 4).unwrap();
		let offset = a.offset();
		drop(a);
		assert_eq!(arena.stats().allocated_bytes, 0);
		assert_eq!(arena.allocate(64, 4).unwrap().offset(), offset);
		assert_eq!(arena.stats().live_blocks, 1);
	}

	#[test]
	fn big_uploads_get_their_own_block() {
		let arena = arena(64);
		let _small = arena.allocate(16, 4).unwrap();
		let big = arena.allocate(1000, 4).unwrap();
		assert_eq!(big.len(), 1000);
		let stats = arena.stats();
		assert_eq!(stats.live_blocks, 2);
		assert!(stats.total_bytes >= 64 + 1000);
	}
}
