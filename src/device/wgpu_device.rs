//! [GpuDevice] on real hardware through `wgpu`.
//!
//! wgpu has no persistently mapped upload memory, so host-visible buffers are backed by a
//! [HostMemory] shadow that gets written into its GPU twin with `queue.write_buffer` right before a
//! submission reads from it. wgpu also tracks texture layouts on its own; transitions are only
//! checked against our own layout tracking here, they don't record anything.

use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU64};
use std::ptr::NonNull;

use futures::channel::oneshot;
use futures::executor::block_on;
use log::{info, trace};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
	check_alignment, check_range, BufferDesc, BufferId, BufferUsage, Command, CommandBuffer, DeviceError, DeviceLimits,
	GpuDevice, HostMemory, ImageDesc, ImageFormat, ImageId, ImageLayout, ImageRegion, MemoryLocation,
};
use crate::memory::suballocator::round_up;

struct WgpuBuffer {
	buffer: wgpu::Buffer,
	size: u64,
	shadow: Option<HostMemory>,
}

struct WgpuImage {
	texture: wgpu::Texture,
	width: u32,
	height: u32,
	format: ImageFormat,
	layout: ImageLayout,
}

#[derive(Default)]
struct WgpuState {
	next_id: u64,
	buffers: HashMap<BufferId, WgpuBuffer>,
	images: HashMap<ImageId, WgpuImage>,
}

pub struct WgpuDevice {
	adapter_name: String,
	device: wgpu::Device,
	queue: wgpu::Queue,
	limits: DeviceLimits,
	state: Mutex<WgpuState>,
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
	let mut usages = wgpu::BufferUsages::empty();
	usages.set(wgpu::BufferUsages::COPY_SRC, usage.transfer_src);
	usages.set(wgpu::BufferUsages::COPY_DST, usage.transfer_dst);
	usages.set(wgpu::BufferUsages::VERTEX, usage.vertex);
	usages.set(wgpu::BufferUsages::INDEX, usage.index);
	usages.set(wgpu::BufferUsages::UNIFORM, usage.uniform);
	usages.set(wgpu::BufferUsages::STORAGE, usage.storage);
	usages
}

fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
	match format {
		ImageFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
		ImageFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
		ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
		ImageFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
		ImageFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
		ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
		ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
		ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
		ImageFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
	}
}

fn copy_texture(texture: &wgpu::Texture, region: ImageRegion) -> wgpu::ImageCopyTexture<'_> {
	wgpu::ImageCopyTexture {
		texture,
		mip_level: 0,
		origin: wgpu::Origin3d {
			x: region.x,
			y: region.y,
			z: 0,
		},
		aspect: wgpu::TextureAspect::All,
	}
}

fn extent(region: ImageRegion) -> wgpu::Extent3d {
	wgpu::Extent3d {
		width: region.width,
		height: region.height,
		depth_or_array_layers: 1,
	}
}

impl WgpuDevice {
	/// Picks the default adapter and opens a device on it.
	pub async fn new() -> Result<Self, DeviceError> {
		let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
		let adapter = instance
			.request_adapter(&wgpu::RequestAdapterOptions {
				power_preference: wgpu::PowerPreference::default(),
				compatible_surface: None,
				force_fallback_adapter: false,
			})
			.await
			.ok_or_else(|| DeviceError::Backend("no suitable adapter".to_string()))?;
		let (device, queue) = adapter
			.request_device(
				&wgpu::DeviceDescriptor {
					label: Some("arena device"),
					features: wgpu::Features::empty(),
					limits: wgpu::Limits::default(),
				},
				None,
			)
			.await
			.map_err(|e| DeviceError::Backend(e.to_string()))?;

		let device_limits = device.limits();
		let limits = DeviceLimits {
			row_pitch_alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
			copy_alignment: wgpu::COPY_BUFFER_ALIGNMENT,
			max_buffer_size: device_limits.max_buffer_size,
			max_image_dimension: device_limits.max_texture_dimension_2d,
		};
		let adapter_name = adapter.get_info().name;
		info!("Opened wgpu device on {}", adapter_name);
		Ok(WgpuDevice {
			adapter_name,
			device,
			queue,
			limits,
			state: Mutex::new(WgpuState::default()),
		})
	}

	/// Runs `f`, turning any validation error it causes into a [DeviceError].
	fn validated<R>(&self, f: impl FnOnce() -> R) -> Result<R, DeviceError> {
		self.device.push_error_scope(wgpu::ErrorFilter::Validation);
		let result = f();
		match block_on(self.device.pop_error_scope()) {
			Some(e) => Err(DeviceError::Backend(e.to_string())),
			None => Ok(result),
		}
	}

	/// Copies `range` of `buffer` into a mappable buffer and reads it back.
	fn read_back(&self, source: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
		let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
			label: Some("arena readback"),
			size,
			usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
			mapped_at_creation: false,
		});
		let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
		encoder.copy_buffer_to_buffer(source, offset, &readback, 0, size);
		self.queue.submit(Some(encoder.finish()));
		self.map_and_read(&readback)
	}

	/// Records `commands` into `encoder`, checking them the same way the headless device does.
	fn encode(
		&self,
		state: &mut WgpuState,
		commands: &CommandBuffer,
		encoder: &mut wgpu::CommandEncoder,
		scratch: &mut Vec<wgpu::Buffer>,
	) -> Result<(), DeviceError> {
		for command in commands.commands() {
			match command {
				Command::CopyBuffer { src, dst, regions } => {
					let source = state.buffer(*src)?;
					let dest = state.buffer(*dst)?;
					for region in regions.iter() {
						check_alignment(region.src_offset, region.size, self.limits.copy_alignment)?;
						check_alignment(region.dst_offset, region.size, self.limits.copy_alignment)?;
						check_range(*src, region.src_offset, region.size, source.size)?;
						check_range(*dst, region.dst_offset, region.size, dest.size)?;
						sync_shadow(&self.queue, source, region.src_offset, region.size);
						encoder.copy_buffer_to_buffer(
							&source.buffer,
							region.src_offset,
							&dest.buffer,
							region.dst_offset,
							region.size,
						);
					}
				}
				Command::FillBuffer { dst, offset, size, value } => {
					check_alignment(*offset, *size, self.limits.copy_alignment)?;
					let dest = state.buffer(*dst)?;
					check_range(*dst, *offset, *size, dest.size)?;
					if *value == 0 {
						encoder.clear_buffer(&dest.buffer, *offset, NonZeroU64::new(*size));
					} else {
						let pattern: Vec<u8> = value.to_le_bytes().iter().copied().cycle().take(*size as usize).collect();
						let source = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
							label: Some("arena fill"),
							contents: &pattern,
							usage: wgpu::BufferUsages::COPY_SRC,
						});
						encoder.copy_buffer_to_buffer(&source, 0, &dest.buffer, *offset, *size);
						scratch.push(source);
					}
				}
				Command::CopyBufferToImage {
					src,
					src_offset,
					bytes_per_row,
					dst,
					region,
				} => {
					let image = state.require_layout(*dst, ImageLayout::TransferDst)?;
					if !region.fits_within(image.width, image.height) {
						return Err(DeviceError::RegionOutOfBounds { image: *dst, region: *region });
					}
					if region.is_empty() {
						continue;
					}
					let texel_size = image.format.texel_size().ok_or(DeviceError::UnsizedFormat(image.format))?;
					let source = state.buffer(*src)?;
					let span = (region.height as u64 - 1) * *bytes_per_row as u64 + (region.width * texel_size) as u64;
					check_range(*src, *src_offset, span, source.size)?;
					sync_shadow(&self.queue, source, *src_offset, span);
					encoder.copy_buffer_to_texture(
						wgpu::ImageCopyBuffer {
							buffer: &source.buffer,
							layout: wgpu::ImageDataLayout {
								offset: *src_offset,
								bytes_per_row: NonZeroU32::new(*bytes_per_row),
								rows_per_image: None,
							},
						},
						copy_texture(&image.texture, *region),
						extent(*region),
					);
				}
				Command::ClearImage { image, pixel } => {
					let target = state.require_layout(*image, ImageLayout::TransferDst)?;
					let full = ImageRegion::full(target.width, target.height);
					let texel_size = target.format.texel_size().ok_or(DeviceError::UnsizedFormat(target.format))?;
					if pixel.len() != texel_size as usize {
						return Err(DeviceError::RegionOutOfBounds { image: *image, region: full });
					}
					let row_bytes = (target.width * texel_size) as u64;
					let pitch = round_up(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64);
					let mut pattern = vec![0u8; (pitch * target.height as u64) as usize];
					for row in pattern.chunks_exact_mut(pitch as usize) {
						for texel in row[..row_bytes as usize].chunks_exact_mut(pixel.len()) {
							texel.copy_from_slice(pixel);
						}
					}
					let source = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
						label: Some("arena clear"),
						contents: &pattern,
						usage: wgpu::BufferUsages::COPY_SRC,
					});
					encoder.copy_buffer_to_texture(
						wgpu::ImageCopyBuffer {
							buffer: &source,
							layout: wgpu::ImageDataLayout {
								offset: 0,
								bytes_per_row: NonZeroU32::new(pitch as u32),
								rows_per_image: None,
							},
						},
						copy_texture(&target.texture, full),
						extent(full),
					);
					scratch.push(source);
				}
				Command::Transition { image, old, new } => {
					let target = state.images.get_mut(image).ok_or(DeviceError::UnknownImage(*image))?;
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
		}
		Ok(())
	}

	fn map_and_read(&self, readback: &wgpu::Buffer) -> Result<Vec<u8>, DeviceError> {
		let slice = readback.slice(..);
		let (sender, receiver) = oneshot::channel();
		slice.map_async(wgpu::MapMode::Read, move |result| {
			let _ = sender.send(result);
		});
		self.device.poll(wgpu::Maintain::Wait);
		block_on(receiver)
			.map_err(|e| DeviceError::Backend(e.to_string()))?
			.map_err(|e| DeviceError::Backend(e.to_string()))?;
		let bytes = slice.get_mapped_range().to_vec();
		readback.unmap();
		Ok(bytes)
	}
}

impl WgpuState {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn buffer(&self, id: BufferId) -> Result<&WgpuBuffer, DeviceError> {
		self.buffers.get(&id).ok_or(DeviceError::UnknownBuffer(id))
	}

	fn image(&self, id: ImageId) -> Result<&WgpuImage, DeviceError> {
		self.images.get(&id).ok_or(DeviceError::UnknownImage(id))
	}

	fn require_layout(&self, id: ImageId, expected: ImageLayout) -> Result<&WgpuImage, DeviceError> {
		let image = self.image(id)?;
		if image.layout != expected {
			return Err(DeviceError::LayoutMismatch {
				image: id,
				expected,
				actual: image.layout,
			});
		}
		Ok(image)
	}
}

/// Pushes the host shadow of `buffer` for `offset..offset + size` to the GPU, if it has one.
fn sync_shadow(queue: &wgpu::Queue, buffer: &WgpuBuffer, offset: u64, size: u64) {
	if let Some(shadow) = &buffer.shadow {
		let end = round_up(offset + size, wgpu::COPY_BUFFER_ALIGNMENT).min(buffer.size);
		let mut bytes = vec![0u8; (end - offset) as usize];
		shadow.read(offset, &mut bytes);
		queue.write_buffer(&buffer.buffer, offset, &bytes);
	}
}

impl GpuDevice for WgpuDevice {
	fn name(&self) -> &str {
		&self.adapter_name
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
		let size = round_up(desc.size, wgpu::COPY_BUFFER_ALIGNMENT);
		let mut usage = buffer_usages(desc.usage);
		let shadow = match desc.location {
			MemoryLocation::HostVisible => {
				usage |= wgpu::BufferUsages::COPY_DST;
				Some(HostMemory::new_zeroed(size)?)
			}
			MemoryLocation::DeviceLocal => None,
		};
		let buffer = self.validated(|| {
			self.device.create_buffer(&wgpu::BufferDescriptor {
				label: desc.label,
				size,
				usage,
				mapped_at_creation: false,
			})
		})?;
		let mut state = self.state.lock();
		let id = BufferId(state.next_id());
		state.buffers.insert(id, WgpuBuffer { buffer, size, shadow });
		trace!("Created {} ({:?}, {} bytes)", id, desc.label, size);
		Ok(id)
	}

	fn destroy_buffer(&self, buffer: BufferId) {
		if let Some(removed) = self.state.lock().buffers.remove(&buffer) {
			removed.buffer.destroy();
		}
	}

	fn mapped_ptr(&self, buffer: BufferId) -> Result<NonNull<u8>, DeviceError> {
		let state = self.state.lock();
		match &state.buffer(buffer)?.shadow {
			Some(shadow) => Ok(shadow.as_ptr()),
			None => Err(DeviceError::NotHostVisible(buffer)),
		}
	}

	fn create_image(&self, desc: &ImageDesc<'_>) -> Result<ImageId, DeviceError> {
		let max = self.limits.max_image_dimension;
		if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
			return Err(DeviceError::BadImageDimensions(desc.width, desc.height, max));
		}
		let texture = self.validated(|| {
			self.device.create_texture(&wgpu::TextureDescriptor {
				label: desc.label,
				size: wgpu::Extent3d {
					width: desc.width,
					height: desc.height,
					depth_or_array_layers: 1,
				},
				mip_level_count: 1,
				sample_count: 1,
				dimension: wgpu::TextureDimension::D2,
				format: texture_format(desc.format),
				usage: wgpu::TextureUsages::TEXTURE_BINDING
					| wgpu::TextureUsages::COPY_DST
					| wgpu::TextureUsages::COPY_SRC,
				view_formats: &[],
			})
		})?;
		let mut state = self.state.lock();
		let id = ImageId(state.next_id());
		state.images.insert(
			id,
			WgpuImage {
				texture,
				width: desc.width,
				height: desc.height,
				format: desc.format,
				layout: ImageLayout::Undefined,
			},
		);
		Ok(id)
	}

	fn destroy_image(&self, image: ImageId) {
		if let Some(removed) = self.state.lock().images.remove(&image) {
			removed.texture.destroy();
		}
	}

	fn submit_and_wait(&self, commands: &CommandBuffer) -> Result<(), DeviceError> {
		if !commands.is_executable() {
			return Err(DeviceError::NotExecutable);
		}
		let mut state = self.state.lock();
		let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
			label: Some("arena transfers"),
		});
		// Pattern sources for fills and clears. Must outlive the submission.
		let mut scratch: Vec<wgpu::Buffer> = Vec::new();

		self.device.push_error_scope(wgpu::ErrorFilter::Validation);
		if let Err(e) = self.encode(&mut state, commands, &mut encoder, &mut scratch) {
			let _ = block_on(self.device.pop_error_scope());
			return Err(e);
		}
		let index = self.queue.submit(Some(encoder.finish()));
		self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
		if let Some(e) = block_on(self.device.pop_error_scope()) {
			return Err(DeviceError::Backend(e.to_string()));
		}
		drop(scratch);
		trace!("wgpu submission of {} commands completed", commands.len());
		Ok(())
	}

	fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
		let state = self.state.lock();
		let source = state.buffer(buffer)?;
		check_range(buffer, offset, out.len() as u64, source.size)?;
		if let Some(shadow) = &source.shadow {
			shadow.read(offset, out);
			return Ok(());
		}
		let align = wgpu::COPY_BUFFER_ALIGNMENT;
		let start = offset - offset % align;
		let end = round_up(offset + out.len() as u64, align).min(source.size);
		let bytes = self.read_back(&source.buffer, start, end - start)?;
		let skip = (offset - start) as usize;
		out.copy_from_slice(&bytes[skip..skip + out.len()]);
		Ok(())
	}

	fn read_image(&self, image: ImageId, region: ImageRegion, out: &mut [u8]) -> Result<(), DeviceError> {
		let state = self.state.lock();
		let source = state.image(image)?;
		let texel_size = source.format.texel_size().ok_or(DeviceError::UnsizedFormat(source.format))? as usize;
		let row_bytes = region.width as usize * texel_size;
		if region.is_empty()
			|| !region.fits_within(source.width, source.height)
			|| out.len() != row_bytes * region.height as usize
		{
			return Err(DeviceError::RegionOutOfBounds { image, region });
		}
		let pitch = round_up(row_bytes as u64, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64);
		let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
			label: Some("arena image readback"),
			size: pitch * region.height as u64,
			usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
			mapped_at_creation: false,
		});
		let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
		encoder.copy_texture_to_buffer(
			copy_texture(&source.texture, region),
			wgpu::ImageCopyBuffer {
				buffer: &readback,
				layout: wgpu::ImageDataLayout {
					offset: 0,
					bytes_per_row: NonZeroU32::new(pitch as u32),
					rows_per_image: None,
				},
			},
			extent(region),
		);
		self.queue.submit(Some(encoder.finish()));
		let bytes = self.map_and_read(&readback)?;
		for (row, dst) in out.chunks_exact_mut(row_bytes).enumerate() {
			let from = row * pitch as usize;
			dst.copy_from_slice(&bytes[from..from + row_bytes]);
		}
		Ok(())
	}
}
