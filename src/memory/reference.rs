//! Typed handles to suballocated device memory.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytemuck::Pod;

use super::growable::{Allocation, PoolCore};
use super::staging::{StagingArena, StagingHandle};
use super::suballocator::round_up;
use crate::context::ArenaError;
use crate::device::{BufferCopy, BufferId, DeviceError};

/// A reference shared between owners. The range is freed when the last one goes away.
pub type SharedReference<T> = Arc<Reference<T>>;

/// Where a reference lives right now, for binding it in a draw or dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBinding {
	pub buffer: BufferId,
	pub offset: u64,
	pub size: u64,
}

/// `count` elements of `T` inside one of a pool's buffers.
///
/// A reference owns its range, not any GPU memory: dropping it returns the range to the pool.
/// Writes are staged and reach the device at the next flush, in the order they were made.
pub struct Reference<T: Pod> {
	pool: Arc<PoolCore>,
	staging: StagingArena,
	block: usize,
	offset: u64,
	/// Bytes reserved in the pool, which can be a bit more than `count * size_of::<T>()`.
	reserved: u64,
	count: usize,
	_marker: PhantomData<T>,
}

impl<T: Pod> Reference<T> {
	pub(crate) fn new(pool: Arc<PoolCore>, staging: StagingArena, allocation: Allocation, count: usize) -> Self {
		Reference {
			pool,
			staging,
			block: allocation.block,
			offset: allocation.offset,
			reserved: allocation.size,
			count,
			_marker: PhantomData,
		}
	}

	pub fn len(&self) -> usize {
		self.count
	}

	pub fn is_empty(&self) -> bool {
		self.count == 0
	}

	/// Offset of the first element inside [Reference::buffer_id].
	pub fn byte_offset(&self) -> u64 {
		self.offset
	}

	pub fn byte_size(&self) -> u64 {
		(self.count * std::mem::size_of::<T>()) as u64
	}

	/// The buffer currently holding this reference. Can change when a grow-in-place pool grows.
	pub fn buffer_id(&self) -> BufferId {
		self.pool.buffer(self.block)
	}

	pub fn binding(&self) -> BufferBinding {
		BufferBinding {
			buffer: self.buffer_id(),
			offset: self.offset,
			size: self.byte_size(),
		}
	}

	/// Byte range a write of `count` elements at `index` turns into. A write that runs to the end of
	/// the reference may be padded up to the copy alignment, since that padding belongs to us too.
	fn transfer_range(&self, index: usize, count: usize) -> Result<(u64, u64), ArenaError> {
		assert!(
			index + count <= self.count,
			"write of elements {}..{} is outside of a reference of {} elements",
			index,
			index + count,
			self.count
		);
		let element = std::mem::size_of::<T>() as u64;
		let offset = self.offset + index as u64 * element;
		let mut size = count as u64 * element;
		let alignment = self.pool.copy_alignment();
		if index + count == self.count {
			size = round_up(size, alignment).min(self.offset + self.reserved - offset);
		}
		if offset % alignment != 0 || size % alignment != 0 {
			return Err(DeviceError::Misaligned {
				offset,
				size,
				alignment,
			}
			.into());
		}
		Ok((offset, size))
	}

	/// Stages `data` and enqueues its copy into elements `index..index + data.len()`.
	///
	/// On a device with a copy alignment above one, a range that doesn't start and end on it fails
	/// with [DeviceError::Misaligned]. The end is exempt when the write reaches the end of the
	/// reference.
	///
	/// # Panics
	///
	/// Panics if the range is outside of this reference.
	pub fn update(&self, index: usize, data: &[T]) -> Result<(), ArenaError> {
		if data.is_empty() {
			return Ok(());
		}
		let (offset, size) = self.transfer_range(index, data.len())?;
		let bytes: &[u8] = bytemuck::cast_slice(data);
		let mut handle = self.staging.allocate(size as usize, std::mem::align_of::<T>() as u64)?;
		let staged = handle.as_mut_slice();
		staged[..bytes.len()].copy_from_slice(bytes);
		staged[bytes.len()..].fill(0);
		self.upload(handle, offset);
		Ok(())
	}

	/// Stages `count` elements and returns them for writing in place. The copy is enqueued when the
	/// window is dropped. Elements start out zeroed.
	pub fn update_with(&self, index: usize, count: usize) -> Result<StagingWindow<'_, T>, ArenaError> {
		let (offset, size) = self.transfer_range(index, count)?;
		let mut handle = self.staging.allocate(size as usize, std::mem::align_of::<T>() as u64)?;
		handle.as_mut_slice().fill(0);
		Ok(StagingWindow {
			reference: self,
			handle: Some(handle),
			offset,
			count,
		})
	}

	/// Sets elements `index..index + count` to zero bytes. Uses a fill when the range is 4-byte
	/// aligned, and a staged copy of zeros otherwise.
	pub fn zero(&self, index: usize, count: usize) -> Result<(), ArenaError> {
		if count == 0 {
			return Ok(());
		}
		let (offset, size) = self.transfer_range(index, count)?;
		if offset % 4 == 0 && size % 4 == 0 {
			self.pool.with_buffer(self.block, |buffer| {
				self.pool
					.scheduler
					.enqueue(move |rec| rec.commands().fill_buffer(buffer, offset, size, 0));
			});
		} else {
			let mut handle = self.staging.allocate(size as usize, 1)?;
			handle.as_mut_slice().fill(0);
			self.upload(handle, offset);
		}
		Ok(())
	}

	/// Reads the whole reference back from the device. Only sees writes that have been flushed.
	pub fn read(&self) -> Result<Vec<T>, ArenaError> {
		let mut out = vec![T::zeroed(); self.count];
		if self.count > 0 {
			self.pool
				.device
				.read_buffer(self.buffer_id(), self.offset, bytemuck::cast_slice_mut(&mut out))?;
		}
		Ok(out)
	}

	fn upload(&self, handle: StagingHandle, dst_offset: u64) {
		let src = handle.buffer();
		let src_offset = handle.offset();
		let size = handle.len() as u64;
		self.pool.with_buffer(self.block, |dst| {
			self.pool.scheduler.enqueue(move |rec| {
				rec.commands().copy_buffer(
					src,
					dst,
					&[BufferCopy {
						src_offset,
						dst_offset,
						size,
					}],
				);
				rec.after_completion(move || drop(handle));
			});
		});
	}
}

impl<T: Pod> fmt::Debug for Reference<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Reference")
			.field("block", &self.block)
			.field("offset", &self.offset)
			.field("count", &self.count)
			.field("reserved", &self.reserved)
			.finish()
	}
}

impl<T: Pod> Drop for Reference<T> {
	fn drop(&mut self) {
		self.pool.free(self.block, self.offset);
	}
}

/// Writable staging memory for part of a [Reference]. Enqueues its upload when dropped.
pub struct StagingWindow<'a, T: Pod> {
	reference: &'a Reference<T>,
	handle: Option<StagingHandle>,
	offset: u64,
	count: usize,
}

impl<'a, T: Pod> Deref for StagingWindow<'a, T> {
	type Target = [T];

	fn deref(&self) -> &[T] {
		match &self.handle {
			Some(handle) => {
				let bytes = &handle.as_slice()[..self.count * std::mem::size_of::<T>()];
				bytemuck::cast_slice(bytes)
			}
			None => &[],
		}
	}
}

impl<'a, T: Pod> DerefMut for StagingWindow<'a, T> {
	fn deref_mut(&mut self) -> &mut [T] {
		let len = self.count * std::mem::size_of::<T>();
		match &mut self.handle {
			Some(handle) => bytemuck::cast_slice_mut(&mut handle.as_mut_slice()[..len]),
			None => &mut [],
		}
	}
}

impl<'a, T: Pod> Drop for StagingWindow<'a, T> {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			self.reference.upload(handle, self.offset);
		}
	}
}
