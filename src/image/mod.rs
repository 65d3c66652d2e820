//! Device images and texture atlases.
//!
//! An [Image] is always in `ShaderReadOnly` layout as far as anything outside a flush is concerned.
//! Every write is recorded as one transfer job that moves the image into `TransferDst`, does the
//! write, and moves it back.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{ArenaContext, ArenaError};
use crate::device::{CommandBuffer, GpuDevice, ImageDesc, ImageFormat, ImageId, ImageLayout, ImageRegion};
use crate::memory::suballocator::round_up;
use crate::memory::{StagingArena, StagingHandle};
use crate::transfer::TransferScheduler;

pub mod atlas;
pub mod packer;

pub use self::atlas::{AtlasConfig, AtlasError, AtlasPool, SubImage};
pub use self::packer::ShelfPacker;

pub struct Image {
	device: Arc<dyn GpuDevice>,
	scheduler: Arc<TransferScheduler>,
	staging: StagingArena,
	id: ImageId,
	width: u32,
	height: u32,
	format: ImageFormat,
	row_pitch_alignment: u32,
	/// Layout as of the last recorded job. Only transfer jobs change it.
	layout: Arc<Mutex<ImageLayout>>,
}

impl Image {
	/// Creates the image and enqueues its initialization: cleared to zero and left in
	/// `ShaderReadOnly`.
	pub fn new(context: &ArenaContext, desc: &ImageDesc<'_>) -> Result<Self, ArenaError> {
		let device = context.device().clone();
		let id = device.create_image(desc)?;
		let image = Image {
			row_pitch_alignment: device.limits().row_pitch_alignment.max(1),
			device,
			scheduler: context.scheduler().clone(),
			staging: context.staging().clone(),
			id,
			width: desc.width,
			height: desc.height,
			format: desc.format,
			layout: Arc::new(Mutex::new(ImageLayout::Undefined)),
		};
		let zero = desc.format.texel_size().map(|size| vec![0u8; size as usize]);
		image.enqueue_write(
			move |commands| {
				if let Some(zero) = zero {
					commands.clear_image(id, &zero);
				}
			},
			None,
		);
		Ok(image)
	}

	pub fn id(&self) -> ImageId {
		self.id
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn size(&self) -> (u32, u32) {
		(self.width, self.height)
	}

	pub fn format(&self) -> ImageFormat {
		self.format
	}

	/// Layout the image will be in once everything enqueued so far has been flushed. Outside of a
	/// flush that's `ShaderReadOnly` for any image whose creation has been recorded.
	pub fn layout(&self) -> ImageLayout {
		*self.layout.lock()
	}

	fn texel_size(&self) -> usize {
		match self.format.texel_size() {
			Some(size) => size as usize,
			None => panic!("format {:?} has no per-texel size, {} can't be written texel by texel", self.format, self.id),
		}
	}

	/// Wraps `record` in the transitions into and out of `TransferDst`, as one job.
	fn enqueue_write<F>(&self, record: F, staging: Option<StagingHandle>)
	where
		F: FnOnce(&mut CommandBuffer) + Send + 'static,
	{
		let id = self.id;
		let layout = self.layout.clone();
		self.scheduler.enqueue(move |rec| {
			let mut current = layout.lock();
			rec.commands().transition(id, *current, ImageLayout::TransferDst);
			record(rec.commands());
			rec.commands().transition(id, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);
			*current = ImageLayout::ShaderReadOnly;
			if let Some(handle) = staging {
				rec.after_completion(move || drop(handle));
			}
		});
	}

	/// Stages texels for `region` and enqueues their upload.
	///
	/// `data` holds `region.height` rows, `src_row_pitch` bytes apart. Only the first
	/// `region.width * texel_size` bytes of each row are used.
	///
	/// # Panics
	///
	/// Panics if the format has no per-texel size, if the region doesn't fit in the image, or if
	/// `data` is too short for the region.
	pub fn update(&self, region: ImageRegion, data: &[u8], src_row_pitch: usize) -> Result<(), ArenaError> {
		let texel_size = self.texel_size();
		assert!(
			region.fits_within(self.width, self.height),
			"region {:?} is outside of {} ({}x{})",
			region,
			self.id,
			self.width,
			self.height
		);
		if region.is_empty() {
			return Ok(());
		}
		let rows = region.height as usize;
		let row_bytes = region.width as usize * texel_size;
		assert!(
			src_row_pitch >= row_bytes && data.len() >= (rows - 1) * src_row_pitch + row_bytes,
			"{} bytes at a pitch of {} can't hold a {}x{} region of {:?}",
			data.len(),
			src_row_pitch,
			region.width,
			region.height,
			self.format
		);

		let pitch = round_up(row_bytes as u64, self.row_pitch_alignment as u64) as usize;
		let mut handle = self.staging.allocate(pitch * rows, texel_size as u64)?;
		let staged = handle.as_mut_slice();
		for row in 0..rows {
			let src = &data[row * src_row_pitch..row * src_row_pitch + row_bytes];
			staged[row * pitch..row * pitch + row_bytes].copy_from_slice(src);
		}

		let id = self.id;
		let src = handle.buffer();
		let src_offset = handle.offset();
		self.enqueue_write(
			move |commands| commands.copy_buffer_to_image(src, src_offset, pitch as u32, id, region),
			Some(handle),
		);
		Ok(())
	}

	/// Enqueues setting every texel to `pixel`.
	///
	/// # Panics
	///
	/// Panics unless `pixel` is exactly one texel long.
	pub fn clear(&self, pixel: &[u8]) {
		let texel_size = self.texel_size();
		assert_eq!(pixel.len(), texel_size, "clear value for {} must be exactly one texel", self.id);
		let id = self.id;
		let pixel = pixel.to_vec();
		self.enqueue_write(move |commands| commands.clear_image(id, &pixel), None);
	}

	/// Reads `region` back as tightly packed rows. Only sees writes that have been flushed.
	pub fn read(&self, region: ImageRegion) -> Result<Vec<u8>, ArenaError> {
		let texel_size = self.texel_size();
		let mut out = vec![0u8; region.width as usize * region.height as usize * texel_size];
		self.device.read_image(self.id, region, &mut out)?;
		Ok(out)
	}
}

impl Drop for Image {
	fn drop(&mut self) {
		let device = self.device.clone();
		let id = self.id;
		self.scheduler.defer(move || device.destroy_image(id));
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::ArenaConfig;
	use crate::device::{Command, HeadlessDevice};

	fn setup() -> (Arc<HeadlessDevice>, Arc<ArenaContext>) {
		ArenaContext::headless(ArenaConfig::default()).unwrap()
	}

	fn image(context: &ArenaContext, width: u32, height: u32, format: ImageFormat) -> Image {
		Image::new(
			context,
			&ImageDesc {
				label: Some("test image"),
				width,
				height,
				format,
			},
		)
		.unwrap()
	}

	fn transitions(history: &[Command]) -> Vec<(ImageLayout, ImageLayout)> {
		history
			.iter()
			.filter_map(|c| match c {
				Command::Transition { old, new, .. } => Some((*old, *new)),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn creation_leaves_image_cleared_and_readable() {
		let (device, context) = setup();
		let image = image(&context, 4, 4, ImageFormat::Rgba8Unorm);
		assert_eq!(device.image_layout(image.id()), Some(ImageLayout::Undefined));
		context.flush().unwrap();

		assert_eq!(image.layout(), ImageLayout::ShaderReadOnly);
		assert_eq!(device.image_layout(image.id()), Some(ImageLayout::ShaderReadOnly));
		assert_eq!(
			transitions(&device.history()),
			vec![
				(ImageLayout::Undefined, ImageLayout::TransferDst),
				(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)
			]
		);
		assert!(image.read(ImageRegion::full(4, 4)).unwrap().iter().all(|b| *b == 0));
	}

	#[test]
	fn update_is_bracketed_by_transitions() {
		let (device, context) = setup();
		let image = image(&context, 8, 8, ImageFormat::Rgba8Unorm);
		context.flush().unwrap();
		device.clear_history();

		let texels = vec![0xabu8; 4 * 4 * 4];
		image.update(ImageRegion::new(2, 2, 4, 4), &texels, 16).unwrap();
		context.flush().unwrap();

		let history = device.history();
		assert_eq!(history.len(), 3);
		assert_eq!(
			history[0],
			Command::Transition {
				image: image.id(),
				old: ImageLayout::ShaderReadOnly,
				new: ImageLayout::TransferDst
			}
		);
		assert!(matches!(history[1], Command::CopyBufferToImage { bytes_per_row: 256, .. }));
		assert_eq!(
			history[2],
			Command::Transition {
				image: image.id(),
				old: ImageLayout::TransferDst,
				new: ImageLayout::ShaderReadOnly
			}
		);
		assert_eq!(device.image_layout(image.id()), Some(ImageLayout::ShaderReadOnly));
	}

	#[test]
	fn update_before_first_flush_records_both_jobs() {
		let (device, context) = setup();
		let image = image(&context, 2, 2, ImageFormat::R8Unorm);
		image.update(ImageRegion::full(2, 2), &[1, 2, 3, 4], 2).unwrap();
		context.flush().unwrap();
		assert_eq!(
			transitions(&device.history()),
			vec![
				(ImageLayout::Undefined, ImageLayout::TransferDst),
				(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly),
				(ImageLayout::ShaderReadOnly, ImageLayout::TransferDst),
				(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)
			]
		);
		assert_eq!(image.read(ImageRegion::full(2, 2)).unwrap(), vec![1, 2, 3, 4]);
	}

	#[test]
	fn source_pitch_is_respected() {
		let (_device, context) = setup();
		let image = image(&context, 4, 2, ImageFormat::Rg8Unorm);
		// Two rows of 2 texels, with 3 junk bytes of padding per row.
		let data = [1, 2, 3, 4, 9, 9, 9, 5, 6, 7, 8];
		image.update(ImageRegion::new(1, 0, 2, 2), &data, 7).unwrap();
		context.flush().unwrap();
		assert_eq!(image.read(ImageRegion::new(1, 0, 2, 2)).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
		assert_eq!(image.read(ImageRegion::new(0, 0, 1, 2)).unwrap(), vec![0, 0, 0, 0]);
	}

	#[test]
	fn clear_sets_every_texel() {
		let (_device, context) = setup();
		let image = image(&context, 3, 3, ImageFormat::Rgba8Unorm);
		image.clear(&[1, 2, 3, 4]);
		context.flush().unwrap();
		let texels = image.read(ImageRegion::full(3, 3)).unwrap();
		assert!(texels.chunks(4).all(|t| t == [1, 2, 3, 4]));
	}

	#[test]
	fn dropped_images_are_destroyed_after_flush() {
		let (device, context) = setup();
		let image = image(&context, 2, 2, ImageFormat::Rgba8Unorm);
		context.flush().unwrap();
		drop(image);
		assert_eq!(device.live_image_count(), 1);
		let other = self::image(&context, 2, 2, ImageFormat::Rgba8Unorm);
		context.flush().unwrap();
		assert_eq!(device.live_image_count(), 1);
		drop(other);
	}

	#[test]
	#[should_panic(expected = "no per-texel size")]
	fn compressed_images_cannot_be_updated() {
		let (_device, context) = setup();
		let image = image(&context, 4, 4, ImageFormat::Bc1RgbaUnorm);
		let _ = image.update(ImageRegion::full(4, 4), &[0; 8], 8);
	}

	#[test]
	#[should_panic(expected = "is outside of")]
	fn region_outside_image_panics() {
		let (_device, context) = setup();
		let image = image(&context, 4, 4, ImageFormat::Rgba8Unorm);
		let _ = image.update(ImageRegion::new(2, 2, 4, 4), &[0; 64], 16);
	}
}
