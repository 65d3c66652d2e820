//! The seam between the arena and whatever actually executes GPU work.
//!
//! Everything above this module (pools, staging, the transfer scheduler, images) talks to a
//! [GpuDevice] and records work into a [CommandBuffer]. A command buffer is a plain list of
//! [Command]s; the device decides how to run it. [HeadlessDevice] executes commands against CPU
//! memory, which is what the tests and the demo use. `WgpuDevice` (behind the `wgpu-backend`
//! feature) replays the same stream through `wgpu`.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod headless;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_device;

pub use self::headless::HeadlessDevice;
#[cfg(feature = "wgpu-backend")]
pub use self::wgpu_device::WgpuDevice;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "buffer#{}", self.0)
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

impl fmt::Display for ImageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "image#{}", self.0)
	}
}

/// What a buffer may be used for once it's on the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferUsage {
	pub transfer_src: bool,
	pub transfer_dst: bool,
	pub vertex: bool,
	pub index: bool,
	pub uniform: bool,
	pub storage: bool,
}

impl BufferUsage {
	pub const fn none() -> Self {
		BufferUsage {
			transfer_src: false,
			transfer_dst: false,
			vertex: false,
			index: false,
			uniform: false,
			storage: false,
		}
	}
	/// Host-visible source of uploads. Never read by shaders.
	pub const fn staging() -> Self {
		BufferUsage { transfer_src: true, ..Self::none() }
	}
	/// Device-local pool memory. Pools need both transfer directions so they can be grown by copy.
	pub const fn device_pool() -> Self {
		BufferUsage { transfer_src: true, transfer_dst: true, ..Self::none() }
	}
	pub const fn vertex() -> Self {
		BufferUsage { vertex: true, ..Self::device_pool() }
	}
	pub const fn index() -> Self {
		BufferUsage { index: true, ..Self::device_pool() }
	}
	pub const fn uniform() -> Self {
		BufferUsage { uniform: true, ..Self::device_pool() }
	}
	pub const fn storage() -> Self {
		BufferUsage { storage: true, ..Self::device_pool() }
	}
	pub const fn union(self, other: BufferUsage) -> Self {
		BufferUsage {
			transfer_src: self.transfer_src || other.transfer_src,
			transfer_dst: self.transfer_dst || other.transfer_dst,
			vertex: self.vertex || other.vertex,
			index: self.index || other.index,
			uniform: self.uniform || other.uniform,
			storage: self.storage || other.storage,
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
	/// Fast for the GPU, not addressable by the CPU. Written through staging copies.
	DeviceLocal,
	/// Persistently mapped into the host address space.
	HostVisible,
}

#[derive(Clone, Debug)]
pub struct BufferDesc<'a> {
	pub label: Option<&'a str>,
	pub size: u64,
	pub usage: BufferUsage,
	pub location: MemoryLocation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
	R8Unorm,
	Rg8Unorm,
	Rgba8Unorm,
	Rgba8UnormSrgb,
	Bgra8Unorm,
	R32Float,
	Rgba16Float,
	Rgba32Float,
	/// Block-compressed. Has no per-texel size, so it can't go through the texel upload path.
	Bc1RgbaUnorm,
}

impl ImageFormat {
	/// Bytes per texel, or None for block-compressed formats.
	pub const fn texel_size(self) -> Option<u32> {
		match self {
			ImageFormat::R8Unorm => Some(1),
			ImageFormat::Rg8Unorm => Some(2),
			ImageFormat::Rgba8Unorm
			| ImageFormat::Rgba8UnormSrgb
			| ImageFormat::Bgra8Unorm
			| ImageFormat::R32Float => Some(4),
			ImageFormat::Rgba16Float => Some(8),
			ImageFormat::Rgba32Float => Some(16),
			ImageFormat::Bc1RgbaUnorm => None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct ImageDesc<'a> {
	pub label: Option<&'a str>,
	pub width: u32,
	pub height: u32,
	pub format: ImageFormat,
}

/// Layout an image is in from the GPU's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
	/// Freshly created, contents undefined.
	Undefined,
	TransferDst,
	TransferSrc,
	ShaderReadOnly,
}

impl ImageLayout {
	/// The transitions the arena actually issues. Everything else is a bug in the caller.
	pub const fn can_transition_to(self, new: ImageLayout) -> bool {
		matches!(
			(self, new),
			(ImageLayout::Undefined, ImageLayout::TransferDst)
				| (ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)
				| (ImageLayout::ShaderReadOnly, ImageLayout::TransferDst)
		)
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferCopy {
	pub src_offset: u64,
	pub dst_offset: u64,
	pub size: u64,
}

/// Rectangle of texels inside an image.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImageRegion {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32,
}

impl ImageRegion {
	pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
		ImageRegion { x, y, width, height }
	}
	pub const fn full(width: u32, height: u32) -> Self {
		ImageRegion { x: 0, y: 0, width, height }
	}
	pub fn fits_within(&self, width: u32, height: u32) -> bool {
		let right = self.x as u64 + self.width as u64;
		let bottom = self.y as u64 + self.height as u64;
		right <= width as u64 && bottom <= height as u64
	}
	pub fn is_empty(&self) -> bool {
		self.width == 0 || self.height == 0
	}
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
	CopyBuffer {
		src: BufferId,
		dst: BufferId,
		regions: SmallVec<[BufferCopy; 2]>,
	},
	/// Fill `size` bytes with a repeated little-endian `value`.
	FillBuffer {
		dst: BufferId,
		offset: u64,
		size: u64,
		value: u32,
	},
	CopyBufferToImage {
		src: BufferId,
		src_offset: u64,
		bytes_per_row: u32,
		dst: ImageId,
		region: ImageRegion,
	},
	/// Set every texel of the image to `pixel`, which is exactly one texel wide.
	ClearImage {
		image: ImageId,
		pixel: SmallVec<[u8; 16]>,
	},
	Transition {
		image: ImageId,
		old: ImageLayout,
		new: ImageLayout,
	},
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecordingState {
	Recording,
	Executable,
}

/// A list of commands recorded for a single submission.
#[derive(Debug)]
pub struct CommandBuffer {
	commands: Vec<Command>,
	state: RecordingState,
}

impl CommandBuffer {
	pub fn new() -> Self {
		CommandBuffer {
			commands: Vec::new(),
			state: RecordingState::Recording,
		}
	}

	/// Discards everything recorded so far and starts recording again.
	pub fn begin(&mut self) {
		self.commands.clear();
		self.state = RecordingState::Recording;
	}

	/// Closes the buffer for recording. Only executable buffers may be submitted.
	pub fn end(&mut self) {
		assert_eq!(self.state, RecordingState::Recording, "ended a command buffer that is not recording");
		self.state = RecordingState::Executable;
	}

	pub fn is_executable(&self) -> bool {
		self.state == RecordingState::Executable
	}

	fn push(&mut self, command: Command) {
		assert_eq!(self.state, RecordingState::Recording, "recorded into a command buffer that is not recording");
		self.commands.push(command);
	}

	pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, regions: &[BufferCopy]) {
		if regions.iter().all(|r| r.size == 0) {
			return;
		}
		self.push(Command::CopyBuffer {
			src,
			dst,
			regions: regions.iter().filter(|r| r.size != 0).copied().collect(),
		});
	}

	pub fn fill_buffer(&mut self, dst: BufferId, offset: u64, size: u64, value: u32) {
		if size == 0 {
			return;
		}
		self.push(Command::FillBuffer { dst, offset, size, value });
	}

	pub fn copy_buffer_to_image(
		&mut self,
		src: BufferId,
		src_offset: u64,
		bytes_per_row: u32,
		dst: ImageId,
		region: ImageRegion,
	) {
		self.push(Command::CopyBufferToImage {
			src,
			src_offset,
			bytes_per_row,
			dst,
			region,
		});
	}

	pub fn clear_image(&mut self, image: ImageId, pixel: &[u8]) {
		self.push(Command::ClearImage {
			image,
			pixel: SmallVec::from_slice(pixel),
		});
	}

	/// Records a layout transition.
	///
	/// # Panics
	///
	/// Panics if `old -> new` is not one of the transitions in [ImageLayout::can_transition_to].
	pub fn transition(&mut self, image: ImageId, old: ImageLayout, new: ImageLayout) {
		assert!(
			old.can_transition_to(new),
			"unsupported layout transition {:?} -> {:?} on {}",
			old,
			new,
			image
		);
		self.push(Command::Transition { image, old, new });
	}

	pub fn commands(&self) -> &[Command] {
		&self.commands
	}
	pub fn len(&self) -> usize {
		self.commands.len()
	}
	pub fn is_empty(&self) -> bool {
		self.commands.is_empty()
	}
}

impl Default for CommandBuffer {
	fn default() -> Self {
		Self::new()
	}
}

/// Alignment rules a device imposes on transfers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
	/// Row pitch of a buffer-to-image copy must be a multiple of this.
	pub row_pitch_alignment: u32,
	/// Offsets and sizes of buffer copies must be multiples of this. Fills always need 4.
	pub copy_alignment: u64,
	pub max_buffer_size: u64,
	pub max_image_dimension: u32,
}

impl Default for DeviceLimits {
	fn default() -> Self {
		DeviceLimits {
			row_pitch_alignment: 256,
			copy_alignment: 1,
			max_buffer_size: 1 << 30,
			max_image_dimension: 8192,
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
	#[error("Out of device memory: tried to allocate {requested} bytes with {available} bytes left")]
	OutOfDeviceMemory { requested: u64, available: u64 },
	#[error("Requested a {0}-byte buffer, which is over the device's maximum buffer size of {1} bytes")]
	BufferTooLarge(u64, u64),
	#[error("Image dimensions {0}x{1} are zero or exceed the device's limit of {2}")]
	BadImageDimensions(u32, u32, u32),
	#[error("Tried to create a zero-sized buffer")]
	ZeroSized,
	#[error("No such buffer: {0}")]
	UnknownBuffer(BufferId),
	#[error("No such image: {0}")]
	UnknownImage(ImageId),
	#[error("Access of {size} bytes at offset {offset} is out of bounds for {buffer}, which is {buffer_size} bytes")]
	OutOfBounds {
		buffer: BufferId,
		offset: u64,
		size: u64,
		buffer_size: u64,
	},
	#[error("Transfer of {size} bytes at offset {offset} is not aligned to {alignment}")]
	Misaligned { offset: u64, size: u64, alignment: u64 },
	#[error("Region {region:?} is outside of {image} or doesn't match the supplied data")]
	RegionOutOfBounds { image: ImageId, region: ImageRegion },
	#[error("{image} is in layout {actual:?}, but the command expected {expected:?}")]
	LayoutMismatch {
		image: ImageId,
		expected: ImageLayout,
		actual: ImageLayout,
	},
	#[error("{0} is not host-visible and can't be mapped")]
	NotHostVisible(BufferId),
	#[error("Format {0:?} has no per-texel byte size")]
	UnsizedFormat(ImageFormat),
	#[error("Submitted a command buffer that was still recording")]
	NotExecutable,
	#[error("Backend error: {0}")]
	Backend(String),
}

/// Anything that can hold buffers and images and run a [CommandBuffer].
///
/// Submission is synchronous: `submit_and_wait` returns once the device has finished executing
/// every command in the buffer.
pub trait GpuDevice: Send + Sync {
	fn name(&self) -> &str;
	fn limits(&self) -> DeviceLimits;

	fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferId, DeviceError>;
	/// Destroying a buffer that is still referenced by unsubmitted commands is the caller's problem.
	fn destroy_buffer(&self, buffer: BufferId);
	/// Host address of a [MemoryLocation::HostVisible] buffer. The mapping is persistent: the
	/// pointer stays valid until the buffer is destroyed.
	fn mapped_ptr(&self, buffer: BufferId) -> Result<NonNull<u8>, DeviceError>;

	fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageId, DeviceError>;
	fn destroy_image(&self, image: ImageId);

	fn submit_and_wait(&self, commands: &CommandBuffer) -> Result<(), DeviceError>;

	/// Reads buffer contents back to the host. Slow, meant for verification and debugging.
	fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<(), DeviceError>;
	/// Reads a region of an image back as tightly packed rows.
	fn read_image(&self, image: ImageId, region: ImageRegion, out: &mut [u8]) -> Result<(), DeviceError>;
}

pub(crate) const HOST_MEMORY_ALIGNMENT: usize = 256;

/// A zeroed, 256-byte-aligned host allocation with a stable address. Backs every host-visible
/// buffer, so pointers handed out by `mapped_ptr` never move.
pub(crate) struct HostMemory {
	ptr: NonNull<u8>,
	layout: Layout,
	len: u64,
}

// The memory is only ever touched through raw pointer copies. Callers are responsible for not
// writing a region while the device reads it, same as real mapped memory.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
	pub fn new_zeroed(len: u64) -> Result<Self, DeviceError> {
		let oom = DeviceError::OutOfDeviceMemory { requested: len, available: 0 };
		let size = usize::try_from(len).map_err(|_| oom.clone())?;
		let layout = Layout::from_size_align(size.max(1), HOST_MEMORY_ALIGNMENT).map_err(|_| oom.clone())?;
		let raw = unsafe { alloc::alloc_zeroed(layout) };
		let ptr = NonNull::new(raw).ok_or(oom)?;
		Ok(HostMemory { ptr, layout, len })
	}

	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn as_ptr(&self) -> NonNull<u8> {
		self.ptr
	}

	/// Caller has already bounds-checked `offset..offset + out.len()`.
	pub fn read(&self, offset: u64, out: &mut [u8]) {
		debug_assert!(offset + out.len() as u64 <= self.len);
		unsafe {
			std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
		}
	}

	/// Caller has already bounds-checked `offset..offset + data.len()`.
	pub fn write(&self, offset: u64, data: &[u8]) {
		debug_assert!(offset + data.len() as u64 <= self.len);
		unsafe {
			std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset as usize), data.len());
		}
	}
}

impl Drop for HostMemory {
	fn drop(&mut self) {
		unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
	}
}

pub(crate) fn check_range(buffer: BufferId, offset: u64, size: u64, buffer_size: u64) -> Result<(), DeviceError> {
	match offset.checked_add(size) {
		Some(end) if end <= buffer_size => Ok(()),
		_ => Err(DeviceError::OutOfBounds {
			buffer,
			offset,
			size,
			buffer_size,
		}),
	}
}

pub(crate) fn check_alignment(offset: u64, size: u64, alignment: u64) -> Result<(), DeviceError> {
	if alignment > 1 && (offset % alignment != 0 || size % alignment != 0) {
		return Err(DeviceError::Misaligned { offset, size, alignment });
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn supported_transitions() {
		use ImageLayout::*;
		assert!(Undefined.can_transition_to(TransferDst));
		assert!(TransferDst.can_transition_to(ShaderReadOnly));
		assert!(ShaderReadOnly.can_transition_to(TransferDst));
		assert!(!Undefined.can_transition_to(ShaderReadOnly));
		assert!(!TransferDst.can_transition_to(TransferSrc));
		assert!(!ShaderReadOnly.can_transition_to(TransferSrc));
		assert!(!TransferSrc.can_transition_to(ShaderReadOnly));
	}

	#[test]
	#[should_panic(expected = "unsupported layout transition")]
	fn recording_unsupported_transition_panics() {
		let mut commands = CommandBuffer::new();
		commands.transition(ImageId(1), ImageLayout::TransferDst, ImageLayout::Undefined);
	}

	#[test]
	#[should_panic(expected = "not recording")]
	fn recording_after_end_panics() {
		let mut commands = CommandBuffer::new();
		commands.end();
		commands.fill_buffer(BufferId(1), 0, 4, 0);
	}

	#[test]
	fn empty_copies_are_dropped() {
		let mut commands = CommandBuffer::new();
		commands.copy_buffer(BufferId(1), BufferId(2), &[BufferCopy { src_offset: 0, dst_offset: 0, size: 0 }]);
		commands.fill_buffer(BufferId(1), 0, 0, 0);
		assert!(commands.is_empty());
	}

	#[test]
	fn host_memory_is_zeroed_and_aligned() {
		let memory = HostMemory::new_zeroed(64).unwrap();
		assert_eq!(memory.as_ptr().as_ptr() as usize % HOST_MEMORY_ALIGNMENT, 0);
		let mut out = [0xffu8; 64];
		memory.read(0, &mut out);
		assert!(out.iter().all(|b| *b == 0));
		memory.write(8, &[1, 2, 3]);
		memory.read(8, &mut out[..3]);
		assert_eq!(&out[..3], &[1, 2, 3]);
	}
}
