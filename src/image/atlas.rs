//! Texture atlases built from shelf-packed pages.

use std::sync::Arc;

use glam::Vec2;
use image::RgbaImage;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::packer::ShelfPacker;
use super::Image;
use crate::context::{ArenaContext, ArenaError};
use crate::device::{ImageDesc, ImageFormat, ImageRegion};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
	pub page_width: u32,
	pub page_height: u32,
	pub format: ImageFormat,
	/// Empty texels kept around every sub-image, so filtering doesn't bleed between neighbours.
	pub padding: u32,
}

impl Default for AtlasConfig {
	fn default() -> Self {
		AtlasConfig {
			page_width: 1024,
			page_height: 1024,
			format: ImageFormat::Rgba8Unorm,
			padding: 2,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum AtlasError {
	#[error("Tried to pack a {0}x{1} image into an atlas with {2}x{3} pages and {4} px of padding, it can never fit")]
	TooLarge(u32, u32, u32, u32, u32),
	#[error("Tried to pack an empty {0}x{1} image into an atlas")]
	Empty(u32, u32),
	#[error("Can't pack RGBA8 images into an atlas of format {0:?}")]
	FormatMismatch(ImageFormat),
	#[error("Arena error while growing or writing to an atlas: {0}")]
	Arena(#[from] ArenaError),
}

/// A rectangle inside one atlas page.
#[derive(Clone, Debug, PartialEq)]
pub struct SubImage {
	pub page: usize,
	/// The usable texels, not counting padding.
	pub region: ImageRegion,
	/// Normalized texture coordinates of `region` within its page.
	pub uv_min: Vec2,
	pub uv_max: Vec2,
	/// What the page's packer actually handed out, padding included.
	outer: ImageRegion,
}

impl SubImage {
	pub fn width(&self) -> u32 {
		self.region.width
	}

	pub fn height(&self) -> u32 {
		self.region.height
	}
}

struct AtlasPage {
	image: Arc<Image>,
	packer: ShelfPacker,
}

/// A growing set of same-sized atlas pages.
///
/// Allocation tries every existing page in order before adding a new one. Sub-images never move
/// between pages.
pub struct AtlasPool {
	context: Arc<ArenaContext>,
	config: AtlasConfig,
	pages: Mutex<Vec<AtlasPage>>,
}

impl AtlasPool {
	pub fn new(context: Arc<ArenaContext>, config: AtlasConfig) -> Self {
		AtlasPool {
			context,
			config,
			pages: Mutex::new(Vec::new()),
		}
	}

	/// An atlas set up from the context's configuration.
	pub fn from_context(context: Arc<ArenaContext>) -> Self {
		let config = context.config().atlas;
		Self::new(context, config)
	}

	pub fn config(&self) -> &AtlasConfig {
		&self.config
	}

	pub fn page_count(&self) -> usize {
		self.pages.lock().len()
	}

	pub fn page_image(&self, page: usize) -> Option<Arc<Image>> {
		self.pages.lock().get(page).map(|p| p.image.clone())
	}

	fn sub_image(&self, page: usize, outer: ImageRegion, width: u32, height: u32) -> SubImage {
		let region = ImageRegion::new(outer.x + self.config.padding, outer.y + self.config.padding, width, height);
		let page_size = Vec2::new(self.config.page_width as f32, self.config.page_height as f32);
		SubImage {
			page,
			region,
			uv_min: Vec2::new(region.x as f32, region.y as f32) / page_size,
			uv_max: Vec2::new((region.x + width) as f32, (region.y + height) as f32) / page_size,
			outer,
		}
	}

	/// Reserves a `width`x`height` rectangle (plus padding) on some page.
	pub fn alloc(&self, width: u32, height: u32) -> Result<SubImage, AtlasError> {
		let AtlasConfig {
			page_width,
			page_height,
			format,
			padding,
		} = self.config;
		if width == 0 || height == 0 {
			return Err(AtlasError::Empty(width, height));
		}
		let too_large = AtlasError::TooLarge(width, height, page_width, page_height, padding);
		let padded_width = width.checked_add(2 * padding).filter(|w| *w <= page_width);
		let padded_height = height.checked_add(2 * padding).filter(|h| *h <= page_height);
		let (Some(padded_width), Some(padded_height)) = (padded_width, padded_height) else {
			return Err(too_large);
		};

		let mut pages = self.pages.lock();
		for (index, page) in pages.iter_mut().enumerate() {
			if let Some(outer) = page.packer.alloc(padded_width, padded_height) {
				return Ok(self.sub_image(index, outer, width, height));
			}
		}

		let image = Image::new(
			&self.context,
			&ImageDesc {
				label: Some("atlas page"),
				width: page_width,
				height: page_height,
				format,
			},
		)?;
		let mut packer = ShelfPacker::new(page_width, page_height);
		let outer = packer.alloc(padded_width, padded_height).ok_or(too_large)?;
		pages.push(AtlasPage {
			image: Arc::new(image),
			packer,
		});
		debug!("Atlas grew to {} pages of {}x{} {:?}", pages.len(), page_width, page_height, format);
		Ok(self.sub_image(pages.len() - 1, outer, width, height))
	}

	/// Allocates a rectangle and enqueues uploading `data` into it. See [Image::update] for the
	/// layout of `data`.
	pub fn pack(&self, width: u32, height: u32, data: &[u8], src_row_pitch: usize) -> Result<SubImage, AtlasError> {
		let sub = self.alloc(width, height)?;
		let image = self.pages.lock()[sub.page].image.clone();
		if let Err(e) = image.update(sub.region, data, src_row_pitch) {
			self.free(&sub);
			return Err(e.into());
		}
		Ok(sub)
	}

	pub fn pack_image(&self, source: &RgbaImage) -> Result<SubImage, AtlasError> {
		if !matches!(self.config.format, ImageFormat::Rgba8Unorm | ImageFormat::Rgba8UnormSrgb) {
			return Err(AtlasError::FormatMismatch(self.config.format));
		}
		let (width, height) = source.dimensions();
		self.pack(width, height, source.as_raw(), width as usize * 4)
	}

	/// Gives a sub-image's rectangle back to its page.
	///
	/// # Panics
	///
	/// Panics if the sub-image was already freed or doesn't belong to this atlas.
	pub fn free(&self, sub: &SubImage) {
		let mut pages = self.pages.lock();
		let freed = pages
			.get_mut(sub.page)
			.map_or(false, |page| page.packer.free(sub.outer));
		assert!(freed, "freed {:?} on atlas page {}, which isn't allocated", sub.region, sub.page);
	}
}

#[cfg(test)]
mod test {
	use image::Rgba;

	use super::*;
	use crate::config::ArenaConfig;
	use crate::device::HeadlessDevice;

	fn atlas(config: AtlasConfig) -> (Arc<HeadlessDevice>, Arc<ArenaContext>, AtlasPool) {
		let (device, context) = ArenaContext::headless(ArenaConfig::default()).unwrap();
		let atlas = AtlasPool::new(context.clone(), config);
		(device, context, atlas)
	}

	#[test]
	fn texture_coordinates_round_trip() {
		let (_device, _context, atlas) = atlas(AtlasConfig::default());
		let sub = atlas.alloc(8, 8).unwrap();
		let page = Vec2::new(1024.0, 1024.0);
		let size = (sub.uv_max - sub.uv_min) * page;
		assert_eq!(size, Vec2::new(8.0, 8.0));
		// Padding is left out of the coordinates.
		assert_eq!(sub.region.x, 2);
		assert_eq!(sub.uv_min * page, Vec2::new(2.0, 2.0));
	}

	#[test]
	fn packed_texels_land_inside_the_padding() {
		let (_device, context, atlas) = atlas(AtlasConfig {
			page_width: 16,
			page_height: 16,
			format: ImageFormat::R8Unorm,
			padding: 1,
		});
		let texels: Vec<u8> = (1..=6).collect();
		let sub = atlas.pack(3, 2, &texels, 3).unwrap();
		context.flush().unwrap();

		let page = atlas.page_image(sub.page).unwrap();
		assert_eq!(page.read(sub.region).unwrap(), texels);
		// The padded border stays clear.
		assert_eq!(page.read(ImageRegion::new(0, 0, 5, 1)).unwrap(), vec![0; 5]);
	}

	#[test]
	fn full_pages_spill_onto_new_pages() {
		let (device, context, atlas) = atlas(AtlasConfig {
			page_width: 16,
			page_height: 16,
			format: ImageFormat::Rgba8Unorm,
			padding: 0,
		});
		let first = atlas.alloc(16, 16).unwrap();
		let second = atlas.alloc(16, 16).unwrap();
		assert_eq!(first.page, 0);
		assert_eq!(second.page, 1);
		assert_eq!(atlas.page_count(), 2);
		context.flush().unwrap();
		assert_eq!(device.live_image_count(), 2);

		atlas.free(&first);
		assert_eq!(atlas.alloc(8, 8).unwrap().page, 0);
	}

	#[test]
	fn oversized_requests_fail() {
		let (_device, _context, atlas) = atlas(AtlasConfig {
			page_width: 16,
			page_height: 16,
			format: ImageFormat::Rgba8Unorm,
			padding: 2,
		});
		assert!(matches!(atlas.alloc(13, 4), Err(AtlasError::TooLarge(13, 4, 16, 16, 2))));
		assert!(matches!(atlas.alloc(0, 4), Err(AtlasError::Empty(0, 4))));
		assert!(atlas.alloc(12, 12).is_ok());
	}

	#[test]
	fn rgba_images_pack_directly() {
		let (_device, context, atlas) = atlas(AtlasConfig::default());
		let source = RgbaImage::from_pixel(2, 3, Rgba([10, 20, 30, 40]));
		let sub = atlas.pack_image(&source).unwrap();
		assert_eq!((sub.width(), sub.height()), (2, 3));
		context.flush().unwrap();
		let texels = atlas.page_image(0).unwrap().read(sub.region).unwrap();
		assert_eq!(texels, source.into_raw());
	}

	#[test]
	fn rgba_images_need_an_rgba_atlas() {
		let (_device, _context, atlas) = atlas(AtlasConfig {
			format: ImageFormat::R8Unorm,
			..AtlasConfig::default()
		});
		let source = RgbaImage::new(1, 1);
		assert!(matches!(atlas.pack_image(&source), Err(AtlasError::FormatMismatch(ImageFormat::R8Unorm))));
	}

	#[test]
	#[should_panic(expected = "isn't allocated")]
	fn double_free_panics() {
		let (_device, _context, atlas) = atlas(AtlasConfig::default());
		let sub = atlas.alloc(4, 4).unwrap();
		atlas.free(&sub);
		atlas.free(&sub);
	}
}
