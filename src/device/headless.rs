//! Software [GpuDevice]. Buffers and images live in host memory and submitted command buffers are
//! executed immediately, in order, on the submitting thread.
//!
//! Besides running without a GPU, it keeps a history of every submitted command and tracks image
//! layouts strictly: copying into an image that isn't in `TransferDst`, or transitioning from a
//! layout the image isn't in, fails the submission.

use std::collections::HashMap;
use std::ptr::NonNull;

use log::{debug, trace};
use parking_lot::Mutex;

use super::{
	check_alignment, check_range, BufferDesc, BufferId, Command, CommandBuffer, DeviceError, DeviceLimits, GpuDevice,
	HostMemory, ImageDesc, ImageFormat, ImageId, ImageLayout, ImageRegion, MemoryLocation,
};

enum BufferStorage {
	Host(HostMemory),
	Device(Vec<u8>),
}

struct HeadlessBuffer {
	size: u64,
	storage: BufferStorage,
}

impl HeadlessBuffer {
	fn read(&self, offset: u64, out: &mut [u8]) {
		match &self.storage {
			BufferStorage::Host(memory) => memory.read(offset, out),
			BufferStorage::Device(bytes) => {
				let start = offset as usize;
				out.copy_from_slice(&bytes[start..start + out.len()]);
			}
		}
	}
	fn write(&mut self, offset: u64, data: &[u8]) {
		match &mut self.storage {
			BufferStorage::Host(memory) => memory.write(offset, data),
			BufferStorage::Device(bytes) => {
				let start = offset as usize;
				bytes[start..start + data.len()].copy_from_slice(data);
			}
		}
	}
}

struct HeadlessImage {
	width: u32,
	height: u32,
	format: ImageFormat,
	layout: ImageLayout,
	/// Tightly packed rows.
	texels: Vec<u8>,
}

impl HeadlessImage {
	fn texel_size(&self) -> Result<u32, DeviceError> {
		self.format.texel_size().ok_or(DeviceError::UnsizedFormat(self.format))
	}
}

#[derive(Default)]
struct HeadlessState {
	next_id: u64,
	buffers: HashMap<BufferId, HeadlessBuffer>,
	images: HashMap<ImageId, HeadlessImage>,
	allocated_bytes: u64,
	submissions: u64,
	history: Vec<Command>,
}

impl HeadlessState {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn buffer(&self, id: BufferId) -> Result<&HeadlessBuffer, DeviceError> {
		self.buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))
	}

	fn buffer_mut(&mut self, id: BufferId) -> Result<&mut HeadlessBuffer, DeviceError> {
		self.buffers.get_mut(&id).ok_or(DeviceError::UnknownBuffer(id))
	}

	fn image_mut(&mut self, id: ImageId) -> Result<&mut HeadlessImage, DeviceError> {
		self.images.get_mut(&id).ok_or(DeviceError::UnknownImage(id))
	}

	fn execute(&mut self, command: &Command, limits: &DeviceLimits) -> Result<(), DeviceError> {
		match command {
			Command::CopyBuffer { src, dst, regions } => {
				for region in regions.iter() {
					check_alignment(region.src_offset, region.size, limits.copy_alignment)?;
					check_alignment(region.dst_offset, region.size, limits.copy_alignment)?;
					let source = self.buffer(*src)?;
					check_range(*src, region.src_offset, region.size, source.size)?;
					// Through a temporary, so a copy within one buffer behaves like memmove.
					let mut bytes = vec![0u8; region.size as usize];
					source.read(region.src_offset, &mut bytes);
					let dest = self.buffer_mut(*dst)?;
					check_range(*dst, region.dst_offset, region.size, dest.size)?;
					dest.write(region.dst_offset, &bytes);
				}
			}
			Command::FillBuffer { dst, offset, size, value } => {
				check_alignment(*offset, *size, limits.copy_alignment.max(4))?;
				let dest = self.buffer_mut(*dst)?;
				check_range(*dst, *offset, *size, dest.size)?;
				let pattern = value.to_le_bytes();
				let bytes: Vec<u8> = pattern.iter().copied().cycle().take(*size as usize).collect();
				dest.write(*offset, &bytes);
			}
			Command::CopyBufferToImage {
				src,
				src_offset,
				bytes_per_row,
				dst,
				region,
			} => {
				let image = self.images.get(dst).ok_or(DeviceError::UnknownImage(*dst))?;
				if image.layout != ImageLayout::TransferDst {
					return Err(DeviceError::LayoutMismatch {
						image: *dst,
						expected: ImageLayout::TransferDst,
						actual: image.layout,
					});
				}
				let texel_size = image.texel_size()? as u64;
				let row_bytes = region.width as u64 * texel_size;
				if !region.fits_within(image.width, image.height) || (*bytes_per_row as u64) < row_bytes {
					return Err(DeviceError::RegionOutOfBounds { image: *dst, region: *region });
				}
				if region.is_empty() {
					return Ok(());
				}
				let image_width = image.width as u64;
				let source = self.buffer(*src)?;
				let span = (region.height as u64 - 1) * *bytes_per_row as u64 + row_bytes;
				check_range(*src, *src_offset, span, source.size)?;

				let mut rows = vec![0u8; span as usize];
				source.read(*src_offset, &mut rows);

				let image = self.image_mut(*dst)?;
				for row in 0..region.height as u64 {
					let from = (row * *bytes_per_row as u64) as usize;
					let to = (((region.y as u64 + row) * image_width + region.x as u64) * texel_size) as usize;
					image.texels[to..to + row_bytes as usize].copy_from_slice(&rows[from..from + row_bytes as usize]);
				}
			}
			Command::ClearImage { image, pixel } => {
				let target = self.image_mut(*image)?;
				if target.layout != ImageLayout::TransferDst {
					return Err(DeviceError::LayoutMismatch {
						image: *image,
						expected: ImageLayout::TransferDst,
						actual: target.layout,
					});
				}
				let texel_size = target.texel_size()? as usize;
				if pixel.len() != texel_size {
					return Err(DeviceError::RegionOutOfBounds {
						image: *image,
						region: ImageRegion::full(target.width, target.height),
					});
				}
				for texel in target.texels.chunks_exact_mut(texel_size) {
					texel.copy_from_slice(pixel);
				}
			}
			Command::Transition { image, old, new } => {
				let target = self.image_mut(*image)?;
				// Undefined as the old layout means "discard whatever was there", valid from anywhere.
				if *old != ImageLayout::Undefined && *old != target.layout {
					return Err(DeviceError::LayoutMismatch {
						image: *image,
						expected: *old,
						actual: target.layout,
					});
				}
				target.layout = *new;
			}
		}
		Ok(())
	}
}

/// A [GpuDevice] that runs entirely on the CPU.
pub struct HeadlessDevice {
	limits: DeviceLimits,
	memory_budget: Option<u64>,
	state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
	pub fn new() -> Self {
		Self::with_limits(DeviceLimits::default())
	}

	pub fn with_limits(limits: DeviceLimits) -> Self {
		HeadlessDevice {
			limits,
			memory_budget: None,
			state: Mutex::new(HeadlessState::default()),
		}
	}

	/// Caps the total bytes of buffers and images this device will hand out, to exercise
	/// out-of-memory paths.
	pub fn with_memory_budget(mut self, bytes: u64) -> Self {
		self.memory_budget = Some(bytes);
		self
	}

	/// How many command buffers have been submitted so far.
	pub fn submission_count(&self) -> u64 {
		self.state.lock().submissions
	}

	/// Every command submitted since creation (or the last [HeadlessDevice::clear_history]).
	pub fn history(&self) -> Vec<Command> {
		self.state.lock().history.clone()
	}

	pub fn clear_history(&self) {
		self.state.lock().history.clear();
	}

	pub fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
		self.state.lock().images.get(&image).map(|i| i.layout)
	}

	pub fn live_buffer_count(&self) -> usize {
		self.state.lock().buffers.len()
	}

	pub fn live_image_count(&self) -> usize {
		self.state.lock().images.len()
	}

	pub fn is_live_buffer(&self, buffer: BufferId) -> bool {
		self.state.lock().buffers.contains_key(&buffer)
	}

	pub fn allocated_bytes(&self) -> u64 {
		self.state.lock().allocated_bytes
	}

	fn reserve(&self, state: &mut HeadlessState, bytes: u64) -> Result<(), DeviceError> {
		if let Some(budget) = self.memory_budget {
			let available = budget.saturating_sub(state.allocated_bytes);
			if bytes > available {
				return Err(DeviceError::OutOfDeviceMemory { requested: bytes, available });
			}
		}
		state.allocated_bytes += bytes;
		Ok(())
	}
}

impl Default for HeadlessDevice {
	fn default() -> Self {
		Self::new()
	}
}

impl GpuDevice for HeadlessDevice {
	fn name(&self) -> &str {
		"headless"
	}

	fn limits(&self) -> DeviceLimits {
		self.limits
	}

	fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError> {
		if desc.size == 0 {
			return Err(DeviceError::ZeroSized);
		}
		if desc.size > self.limits.max_buffer_size {
			return Err(DeviceError::BufferTooLarge(desc.size, self.limits.max_buffer_size));
		}
		let mut state = self.state.lock();
		self.reserve(&mut state, desc.size)?;
		let storage = match desc.location {
			MemoryLocation::HostVisible => BufferStorage::Host(HostMemory::new_zeroed(desc.size)?),
			MemoryLocation::DeviceLocal => BufferStorage::Device(vec![0u8; desc.size as usize]),
		};
		let id = BufferId(state.next_id());
		state.buffers.insert(id, HeadlessBuffer { size: desc.size, storage });
		trace!("Created {} ({:?}, {} bytes, {:?})", id, desc.label, desc.size, desc.location);
		Ok(id)
	}

	fn destroy_buffer(&self, buffer: BufferId) {
		let mut state = self.state.lock();
		if let Some(removed) = state.buffers.remove(&buffer) {
			state.allocated_bytes -= removed.size;
			trace!("Destroyed {}", buffer);
		} else {
			debug!("Tried to destroy {}, which doesn't exist", buffer);
		}
	}

	fn mapped_ptr(&self, buffer: BufferId) -> Result<NonNull<u8>, DeviceError> {
		let state = self.state.lock();
		match &state.buffer(buffer)?.storage {
			BufferStorage::Host(memory) => Ok(memory.as_ptr()),
			BufferStorage::Device(_) => Err(DeviceError::NotHostVisible(buffer)),
		}
	}

	fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageId, DeviceError> {
		let max = self.limits.max_image_dimension;
		if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
			return Err(DeviceError::BadImageDimensions(desc.width, desc.height, max));
		}
		// Block-compressed images get a nominal byte per texel; they can't be uploaded here anyway.
		let texel_size = desc.format.texel_size().unwrap_or(1) as u64;
		let bytes = desc.width as u64 * desc.height as u64 * texel_size;
		let mut state = self.state.lock();
		self.reserve(&mut state, bytes)?;
		let id = ImageId(state.next_id());
		state.images.insert(
			id,
			HeadlessImage {
				width: desc.width,
				height: desc.height,
				format: desc.format,
				layout: ImageLayout::Undefined,
				texels: vec![0u8; bytes as usize],
			},
		);
		trace!("Created {} ({:?}, {}x{} {:?})", id, desc.label, desc.width, desc.height, desc.format);
		Ok(id)
	}

	fn destroy_image(&self, image: ImageId) {
		let mut state = self.state.lock();
		if let Some(removed) = state.images.remove(&image) {
			state.allocated_bytes -= removed.texels.len() as u64;
		}
	}

	fn submit_and_wait(&self, commands: &CommandBuffer) -> Result<(), DeviceError> {
		if !commands.is_executable() {
			return Err(DeviceError::NotExecutable);
		}
		let mut state = self.state.lock();
		state.submissions += 1;
		for command in commands.commands() {
			state.execute(command, &self.limits)?;
			state.history.push(command.clone());
		}
		trace!("Headless submission #{} ran {} commands", state.submissions, commands.len());
		Ok(())
	}

	fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
		let state = self.state.lock();
		let source = state.buffer(buffer)?;
		check_range(buffer, offset, out.len() as u64, source.size)?;
		source.read(offset, out);
		Ok(())
	}

	fn read_image(&self, image: ImageId, region: ImageRegion, out: &mut [u8]) -> Result<(), DeviceError> {
		let state = self.state.lock();
		let source = state.images.get(&image).ok_or(DeviceError::UnknownImage(image))?;
		let texel_size = source.texel_size()? as usize;
		let row_bytes = region.width as usize * texel_size;
		if !region.fits_within(source.width, source.height) || out.len() != row_bytes * region.height as usize {
			return Err(DeviceError::RegionOutOfBounds { image, region });
		}
		for row in 0..region.height as usize {
			let from = ((region.y as usize + row) * source.width as usize + region.x as usize) * texel_size;
			out[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(&source.texels[from..from + row_bytes]);
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::device::{BufferCopy, BufferUsage};

	fn buffer(device: &HeadlessDevice, size: u64, location: MemoryLocation) -> BufferId {
		device
			.create_buffer(&BufferDesc {
				label: None,
				size,
				usage: BufferUsage::device_pool(),
				location,
			})
			.unwrap()
	}

	#[test]
	fn copies_from_mapped_memory() {
		let device = HeadlessDevice::new();
		let staging = buffer(&device, 16, MemoryLocation::HostVisible);
		let target = buffer(&device, 16, MemoryLocation::DeviceLocal);
		let ptr = device.mapped_ptr(staging).unwrap();
		unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };

		let mut commands = CommandBuffer::new();
		commands.copy_buffer(staging, target, &[BufferCopy { src_offset: 0, dst_offset: 8, size: 4 }]);
		commands.end();
		device.submit_and_wait(&commands).unwrap();

		let mut out = [0u8; 4];
		device.read_buffer(target, 8, &mut out).unwrap();
		assert_eq!(out, [1, 2, 3, 4]);
		assert_eq!(device.submission_count(), 1);
	}

	#[test]
	fn device_local_memory_is_not_mappable() {
		let device = HeadlessDevice::new();
		let target = buffer(&device, 16, MemoryLocation::DeviceLocal);
		assert_eq!(device.mapped_ptr(target), Err(DeviceError::NotHostVisible(target)));
	}

	#[test]
	fn memory_budget_is_enforced() {
		let device = HeadlessDevice::new().with_memory_budget(64);
		buffer(&device, 48, MemoryLocation::DeviceLocal);
		let err = device
			.create_buffer(&BufferDesc {
				label: None,
				size: 32,
				usage: BufferUsage::device_pool(),
				location: MemoryLocation::DeviceLocal,
			})
			.unwrap_err();
		assert_eq!(err, DeviceError::OutOfDeviceMemory { requested: 32, available: 16 });
	}

	#[test]
	fn rejects_unaligned_fill() {
		let device = HeadlessDevice::new();
		let target = buffer(&device, 16, MemoryLocation::DeviceLocal);
		let mut commands = CommandBuffer::new();
		commands.fill_buffer(target, 2, 4, 0);
		commands.end();
		assert!(matches!(device.submit_and_wait(&commands), Err(DeviceError::Misaligned { .. })));
	}

	#[test]
	fn image_copy_requires_transfer_dst() {
		let device = HeadlessDevice::new();
		let staging = buffer(&device, 64, MemoryLocation::HostVisible);
		let image = device
			.create_image(&ImageDesc {
				label: None,
				width: 2,
				height: 2,
				format: ImageFormat::Rgba8Unorm,
			})
			.unwrap();

		let mut commands = CommandBuffer::new();
		commands.copy_buffer_to_image(staging, 0, 8, image, ImageRegion::full(2, 2));
		commands.end();
		assert!(matches!(
			device.submit_and_wait(&commands),
			Err(DeviceError::LayoutMismatch { expected: ImageLayout::TransferDst, .. })
		));

		let mut commands = CommandBuffer::new();
		commands.transition(image, ImageLayout::Undefined, ImageLayout::TransferDst);
		commands.clear_image(image, &[9, 9, 9, 9]);
		commands.transition(image, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);
		commands.end();
		device.submit_and_wait(&commands).unwrap();
		assert_eq!(device.image_layout(image), Some(ImageLayout::ShaderReadOnly));

		let mut out = [0u8; 16];
		device.read_image(image, ImageRegion::full(2, 2), &mut out).unwrap();
		assert!(out.iter().all(|b| *b == 9));
	}

	#[test]
	fn destroying_releases_budget() {
		let device = HeadlessDevice::new().with_memory_budget(32);
		let first = buffer(&device, 32, MemoryLocation::DeviceLocal);
		device.destroy_buffer(first);
		assert_eq!(device.allocated_bytes(), 0);
		buffer(&device, 32, MemoryLocation::DeviceLocal);
		assert_eq!(device.live_buffer_count(), 1);
	}
}
