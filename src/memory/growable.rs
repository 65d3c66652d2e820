//! Suballocated device buffers that grow on demand.

use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::reference::{Reference, SharedReference};
use super::staging::StagingArena;
use super::suballocator::{round_up, RangeAllocator};
use crate::context::{ArenaContext, ArenaError};
use crate::device::{BufferCopy, BufferDesc, BufferId, BufferUsage, DeviceError, GpuDevice, MemoryLocation};
use crate::transfer::TransferScheduler;

/// How a pool gets more room once none of its buffers can satisfy a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrowthMode {
	/// Create another buffer next to the existing ones. References never move.
	Append,
	/// Replace the pool's only buffer with a bigger one and copy the live data across. References
	/// follow the replacement. Device-local pools only.
	Replace,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
	/// Every block ever created, including retired ones.
	pub blocks: usize,
	pub live_blocks: usize,
	/// Bytes of device memory held by live blocks.
	pub total_bytes: u64,
	pub allocated_bytes: u64,
	/// Bumped each time the pool grows.
	pub generation: u64,
}

struct Block {
	buffer: BufferId,
	size: u64,
	allocator: RangeAllocator,
	/// Base address of the persistent mapping, for host-visible pools.
	mapped: Option<NonNull<u8>>,
	retired: bool,
}

// The mapping is only dereferenced through staging handles, which own disjoint ranges.
unsafe impl Send for Block {}

struct PoolState {
	/// Index-stable: slots are never removed or reused, references hold indices into this.
	blocks: Vec<Block>,
	total_size: u64,
	generation: u64,
}

/// One suballocated range, as handed out by [PoolCore::alloc].
pub(crate) struct Allocation {
	pub block: usize,
	pub offset: u64,
	/// Reserved bytes, rounded up to the device's copy alignment.
	pub size: u64,
	pub buffer: BufferId,
	pub mapped: Option<NonNull<u8>>,
}

/// The shared part of a pool. Both [GrowableBuffer] and [StagingArena] are thin wrappers around an
/// `Arc` of one of these, and every reference or staging handle keeps its pool alive.
pub(crate) struct PoolCore {
	pub(crate) device: Arc<dyn GpuDevice>,
	pub(crate) scheduler: Arc<TransferScheduler>,
	label: String,
	usage: BufferUsage,
	location: MemoryLocation,
	mode: GrowthMode,
	initial_size: u64,
	copy_alignment: u64,
	state: Mutex<PoolState>,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
	while b != 0 {
		let t = a % b;
		a = b;
		b = t;
	}
	a
}

/// Smallest alignment that satisfies both `a` and `b`.
fn combine_alignment(a: u64, b: u64) -> u64 {
	let (a, b) = (a.max(1), b.max(1));
	a / gcd(a, b) * b
}

impl PoolCore {
	pub(crate) fn new(
		device: Arc<dyn GpuDevice>,
		scheduler: Arc<TransferScheduler>,
		label: &str,
		usage: BufferUsage,
		location: MemoryLocation,
		mode: GrowthMode,
		initial_size: u64,
	) -> Self {
		assert!(
			!(mode == GrowthMode::Replace && location == MemoryLocation::HostVisible),
			"grow-in-place pools must be device-local, '{}' is host-visible",
			label
		);
		let copy_alignment = device.limits().copy_alignment.max(1);
		PoolCore {
			device,
			scheduler,
			label: label.to_string(),
			usage,
			location,
			mode,
			initial_size: round_up(initial_size.max(1), copy_alignment),
			copy_alignment,
			state: Mutex::new(PoolState {
				blocks: Vec::new(),
				total_size: 0,
				generation: 0,
			}),
		}
	}

	pub(crate) fn copy_alignment(&self) -> u64 {
		self.copy_alignment
	}

	pub(crate) fn mode(&self) -> GrowthMode {
		self.mode
	}

	/// Creates the first block up front, so construction fails instead of the first allocation.
	pub(crate) fn reserve_initial(&self) -> Result<(), ArenaError> {
		let mut state = self.state.lock();
		if state.blocks.is_empty() {
			self.append_block(&mut state, self.initial_size)?;
		}
		Ok(())
	}

	/// Reserves `size` bytes aligned to `align`, growing the pool if nothing fits.
	pub(crate) fn alloc(&self, size: u64, align: u64) -> Result<Allocation, ArenaError> {
		let size = round_up(size.max(1), self.copy_alignment);
		let align = combine_alignment(align, self.copy_alignment);

		let mut state = self.state.lock();
		for (index, block) in state.blocks.iter_mut().enumerate() {
			if block.retired {
				continue;
			}
			if let Some(offset) = block.allocator.alloc(size, align) {
				return Ok(block.allocation(index, offset, size));
			}
		}

		let index = match self.mode {
			GrowthMode::Append => self.append_block(&mut state, size)?,
			GrowthMode::Replace if state.blocks.is_empty() => self.append_block(&mut state, size)?,
			GrowthMode::Replace => self.replace_block(&mut state, size, align)?,
		};
		let block = &mut state.blocks[index];
		let offset = block
			.allocator
			.alloc(size, align)
			.expect("freshly grown block can't hold the allocation it was grown for");
		Ok(block.allocation(index, offset, size))
	}

	fn create_buffer(&self, size: u64) -> Result<(BufferId, Option<NonNull<u8>>), DeviceError> {
		let buffer = self.device.create_buffer(&BufferDesc {
			label: Some(&self.label),
			size,
			usage: self.usage,
			location: self.location,
		})?;
		let mapped = match self.location {
			MemoryLocation::HostVisible => match self.device.mapped_ptr(buffer) {
				Ok(ptr) => Some(ptr),
				Err(e) => {
					self.device.destroy_buffer(buffer);
					return Err(e);
				}
			},
			MemoryLocation::DeviceLocal => None,
		};
		Ok((buffer, mapped))
	}

	/// Clamps a growth size to what the device allows, as long as `needed` still fits.
	fn growth_size(&self, wanted: u64, needed: u64) -> u64 {
		let max = self.device.limits().max_buffer_size;
		round_up(wanted.min(max).max(needed), self.copy_alignment)
	}

	fn append_block(&self, state: &mut PoolState, needed: u64) -> Result<usize, ArenaError> {
		let size = self.growth_size(needed.max(self.initial_size).max(2 * state.total_size), needed);
		let (buffer, mapped) = self.create_buffer(size)?;
		state.blocks.push(Block {
			buffer,
			size,
			allocator: RangeAllocator::new(size),
			mapped,
			retired: false,
		});
		state.total_size += size;
		state.generation += 1;
		debug!(
			"Pool '{}' appended {} ({} bytes), now {} bytes over {} blocks",
			self.label,
			buffer,
			size,
			state.total_size,
			state.blocks.len()
		);
		Ok(state.blocks.len() - 1)
	}

	fn replace_block(&self, state: &mut PoolState, needed: u64, align: u64) -> Result<usize, ArenaError> {
		let old_size = state.blocks[0].size;
		let size = self.growth_size((2 * old_size).max(old_size + needed + align), old_size + needed + align);
		let (buffer, _) = self.create_buffer(size)?;

		let block = &mut state.blocks[0];
		let old_buffer = block.buffer;
		let live = block.allocator.live_span();
		block.buffer = buffer;
		block.size = size;
		block.allocator.grow(size);
		state.total_size = size;
		state.generation += 1;

		// The copy reads the old buffer after every write that was enqueued against it, and the
		// old buffer stays alive until that copy has executed.
		let device = self.device.clone();
		self.scheduler.enqueue(move |rec| {
			if let Some(live) = live {
				rec.commands().copy_buffer(
					old_buffer,
					buffer,
					&[BufferCopy {
						src_offset: live.start,
						dst_offset: live.start,
						size: live.end - live.start,
					}],
				);
			}
			rec.after_completion(move || device.destroy_buffer(old_buffer));
		});
		debug!(
			"Pool '{}' grew in place from {} ({} bytes) to {} ({} bytes)",
			self.label, old_buffer, old_size, buffer, size
		);
		Ok(0)
	}

	/// Returns a range to its block. Drained blocks that aren't the newest get retired.
	///
	/// # Panics
	///
	/// Panics if nothing is allocated at `offset`.
	pub(crate) fn free(&self, block: usize, offset: u64) {
		let mut state = self.state.lock();
		let newest = state.blocks.len() - 1;
		let entry = &mut state.blocks[block];
		assert!(
			entry.allocator.free(offset),
			"double free at offset {} of block {} in pool '{}'",
			offset,
			block,
			self.label
		);
		if self.mode == GrowthMode::Append && block != newest && entry.allocator.is_empty() {
			self.retire(&mut state, block);
		}
	}

	fn retire(&self, state: &mut PoolState, index: usize) {
		let block = &mut state.blocks[index];
		if block.retired {
			return;
		}
		block.retired = true;
		block.mapped = None;
		let buffer = block.buffer;
		state.total_size -= block.size;
		debug!("Pool '{}' retired {}, destroying it after the next flush", self.label, buffer);
		let device = self.device.clone();
		self.scheduler.defer(move || device.destroy_buffer(buffer));
	}

	/// The buffer currently backing `block`. In grow-in-place pools this changes on growth.
	pub(crate) fn buffer(&self, block: usize) -> BufferId {
		self.state.lock().blocks[block].buffer
	}

	/// Runs `f` with the current buffer of `block` while holding the pool lock, so a growth can't
	/// slip in between looking the buffer up and enqueueing work against it.
	pub(crate) fn with_buffer<R>(&self, block: usize, f: impl FnOnce(BufferId) -> R) -> R {
		let state = self.state.lock();
		f(state.blocks[block].buffer)
	}

	/// Merges free ranges everywhere and retires drained blocks other than the newest.
	pub(crate) fn compact(&self) {
		let mut state = self.state.lock();
		for block in state.blocks.iter_mut() {
			block.allocator.merge();
		}
		if self.mode == GrowthMode::Append && !state.blocks.is_empty() {
			let newest = state.blocks.len() - 1;
			for index in 0..newest {
				if !state.blocks[index].retired && state.blocks[index].allocator.is_empty() {
					self.retire(&mut state, index);
				}
			}
		}
		trace!("Compacted pool '{}'", self.label);
	}

	pub(crate) fn stats(&self) -> PoolStats {
		let state = self.state.lock();
		let live = state.blocks.iter().filter(|b| !b.retired);
		PoolStats {
			blocks: state.blocks.len(),
			live_blocks: live.clone().count(),
			total_bytes: state.total_size,
			allocated_bytes: live.map(|b| b.allocator.allocated_bytes()).sum(),
			generation: state.generation,
		}
	}

	pub(crate) fn live_buffers(&self) -> Vec<BufferId> {
		let state = self.state.lock();
		state.blocks.iter().filter(|b| !b.retired).map(|b| b.buffer).collect()
	}
}

impl Block {
	fn allocation(&self, index: usize, offset: u64, size: u64) -> Allocation {
		Allocation {
			block: index,
			offset,
			size,
			buffer: self.buffer,
			// Offsets are always inside the mapping.
			mapped: self
				.mapped
				.map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }),
		}
	}
}

impl Drop for PoolCore {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		for block in state.blocks.iter().filter(|b| !b.retired) {
			let device = self.device.clone();
			let buffer = block.buffer;
			self.scheduler.defer(move || device.destroy_buffer(buffer));
		}
	}
}

/// Parameters for [GrowableBuffer::new].
#[derive(Clone, Debug)]
pub struct PoolDesc<'a> {
	pub label: &'a str,
	pub usage: BufferUsage,
	/// Size of the first buffer. Defaults to the context's configured pool size when `None`.
	pub initial_size: Option<u64>,
	pub mode: GrowthMode,
}

/// A device-local pool that hands out typed [Reference]s and grows when it runs out of room.
///
/// Writes go through the context's staging arena and land on the device at the next flush.
pub struct GrowableBuffer {
	core: Arc<PoolCore>,
	staging: StagingArena,
}

impl GrowableBuffer {
	pub fn new(context: &ArenaContext, desc: &PoolDesc<'_>) -> Result<Self, ArenaError> {
		let core = Arc::new(PoolCore::new(
			context.device().clone(),
			context.scheduler().clone(),
			desc.label,
			desc.usage.union(BufferUsage::device_pool()),
			MemoryLocation::DeviceLocal,
			desc.mode,
			desc.initial_size.unwrap_or(context.config().default_pool_size),
		));
		core.reserve_initial()?;
		Ok(GrowableBuffer {
			core,
			staging: context.staging().clone(),
		})
	}

	/// Reserves room for `count` elements of `T` at an offset that is a multiple of `align`.
	pub fn allocate<T: Pod>(&self, count: usize, align: u64) -> Result<Reference<T>, ArenaError> {
		let bytes = (count * std::mem::size_of::<T>()).max(std::mem::size_of::<T>()) as u64;
		let allocation = self.core.alloc(bytes, align)?;
		Ok(Reference::new(self.core.clone(), self.staging.clone(), allocation, count))
	}

	pub fn allocate_shared<T: Pod>(&self, count: usize, align: u64) -> Result<SharedReference<T>, ArenaError> {
		self.allocate(count, align).map(Arc::new)
	}

	/// Merges free ranges and retires drained buffers.
	pub fn compact(&self) {
		self.core.compact();
	}

	pub fn stats(&self) -> PoolStats {
		self.core.stats()
	}

	pub fn mode(&self) -> GrowthMode {
		self.core.mode()
	}

	/// Buffers currently backing this pool, oldest first.
	pub fn buffers(&self) -> Vec<BufferId> {
		self.core.live_buffers()
	}
}
