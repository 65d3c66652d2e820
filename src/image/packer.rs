//! Shelf bin packing for atlas pages.

use crate::device::ImageRegion;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Span {
	x: u32,
	width: u32,
	used: bool,
}

#[derive(Clone, Debug)]
struct Shelf {
	y: u32,
	height: u32,
	/// Covers `0..page width` with no gaps, sorted by x.
	spans: Vec<Span>,
}

impl Shelf {
	fn is_empty(&self) -> bool {
		self.spans.iter().all(|s| !s.used)
	}
}

/// Packs rectangles into a fixed-size page in horizontal shelves.
///
/// A rectangle goes on the first shelf that is at least as tall as it and no more than twice as
/// tall, in the first free span that is wide enough. When no shelf fits, a new one exactly as tall
/// as the rectangle is opened under the last one.
#[derive(Clone, Debug)]
pub struct ShelfPacker {
	width: u32,
	height: u32,
	shelves: Vec<Shelf>,
}

impl ShelfPacker {
	pub fn new(width: u32, height: u32) -> Self {
		ShelfPacker {
			width,
			height,
			shelves: Vec::new(),
		}
	}

	/// Bottom of the lowest shelf.
	fn used_height(&self) -> u32 {
		self.shelves.last().map_or(0, |s| s.y + s.height)
	}

	pub fn alloc(&mut self, width: u32, height: u32) -> Option<ImageRegion> {
		if width == 0 || height == 0 || width > self.width || height > self.height {
			return None;
		}
		for shelf in self.shelves.iter_mut() {
			if shelf.height < height || shelf.height as u64 > 2 * height as u64 {
				continue;
			}
			if let Some(x) = Self::take_span(shelf, width) {
				return Some(ImageRegion::new(x, shelf.y, width, height));
			}
		}

		let y = self.used_height();
		if y as u64 + height as u64 > self.height as u64 {
			return None;
		}
		let mut shelf = Shelf {
			y,
			height,
			spans: vec![Span {
				x: 0,
				width: self.width,
				used: false,
			}],
		};
		let x = Self::take_span(&mut shelf, width)?;
		self.shelves.push(shelf);
		Some(ImageRegion::new(x, y, width, height))
	}

	fn take_span(shelf: &mut Shelf, width: u32) -> Option<u32> {
		let index = shelf.spans.iter().position(|s| !s.used && s.width >= width)?;
		let span = shelf.spans[index];
		if span.width > width {
			shelf.spans.insert(
				index + 1,
				Span {
					x: span.x + width,
					width: span.width - width,
					used: false,
				},
			);
		}
		shelf.spans[index] = Span {
			x: span.x,
			width,
			used: true,
		};
		Some(span.x)
	}

	/// Gives back a rectangle returned by [ShelfPacker::alloc]. Returns false if it wasn't allocated.
	pub fn free(&mut self, region: ImageRegion) -> bool {
		let Some(shelf) = self.shelves.iter_mut().find(|s| s.y == region.y) else {
			return false;
		};
		let Some(index) = shelf
			.spans
			.iter()
			.position(|s| s.used && s.x == region.x && s.width == region.width)
		else {
			return false;
		};
		shelf.spans[index].used = false;

		// Merge with free neighbours.
		if index + 1 < shelf.spans.len() && !shelf.spans[index + 1].used {
			let next = shelf.spans.remove(index + 1);
			shelf.spans[index].width += next.width;
		}
		if index > 0 && !shelf.spans[index - 1].used {
			let current = shelf.spans.remove(index);
			shelf.spans[index - 1].width += current.width;
		}

		while self.shelves.last().map_or(false, Shelf::is_empty) {
			self.shelves.pop();
		}
		true
	}

	pub fn is_empty(&self) -> bool {
		self.shelves.iter().all(Shelf::is_empty)
	}

	pub fn shelf_count(&self) -> usize {
		self.shelves.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn overlaps(a: &ImageRegion, b: &ImageRegion) -> bool {
		a.x < b.x + b.width && b.x < a.x + a.width && a.y < b.y + b.height && b.y < a.y + a.height
	}

	#[test]
	fn fills_a_shelf_left_to_right() {
		let mut packer = ShelfPacker::new(32, 32);
		assert_eq!(packer.alloc(8, 8), Some(ImageRegion::new(0, 0, 8, 8)));
		assert_eq!(packer.alloc(8, 8), Some(ImageRegion::new(8, 0, 8, 8)));
		assert_eq!(packer.alloc(16, 5), Some(ImageRegion::new(16, 0, 16, 5)));
		assert_eq!(packer.shelf_count(), 1);
	}

	#[test]
	fn too_short_requests_open_a_new_shelf() {
		let mut packer = ShelfPacker::new(32, 32);
		packer.alloc(4, 16).unwrap();
		// 16 is more than twice 4, so this doesn't go on the first shelf.
		assert_eq!(packer.alloc(4, 4), Some(ImageRegion::new(0, 16, 4, 4)));
		assert_eq!(packer.shelf_count(), 2);
	}

	#[test]
	fn rejects_what_does_not_fit() {
		let mut packer = ShelfPacker::new(16, 16);
		assert_eq!(packer.alloc(17, 1), None);
		assert_eq!(packer.alloc(0, 1), None);
		packer.alloc(16, 10).unwrap();
		assert_eq!(packer.alloc(16, 7), None);
		assert!(packer.alloc(16, 6).is_some());
	}

	#[test]
	fn freed_space_is_reused_and_merged() {
		let mut packer = ShelfPacker::new(24, 8);
		let a = packer.alloc(8, 8).unwrap();
		let b = packer.alloc(8, 8).unwrap();
		let _c = packer.alloc(8, 8).unwrap();
		assert!(packer.free(a));
		assert!(packer.free(b));
		assert!(!packer.free(b));
		assert_eq!(packer.alloc(16, 8), Some(ImageRegion::new(0, 0, 16, 8)));
	}

	#[test]
	fn trailing_empty_shelves_are_reclaimed() {
		let mut packer = ShelfPacker::new(16, 16);
		let _top = packer.alloc(16, 8).unwrap();
		let bottom = packer.alloc(4, 2).unwrap();
		assert_eq!(packer.shelf_count(), 2);
		packer.free(bottom);
		assert_eq!(packer.shelf_count(), 1);
		// The reclaimed rows can hold a differently shaped shelf now.
		assert_eq!(packer.alloc(16, 8), Some(ImageRegion::new(0, 8, 16, 8)));
	}

	#[test]
	fn packed_regions_never_overlap() {
		let mut packer = ShelfPacker::new(64, 64);
		let mut placed: Vec<ImageRegion> = Vec::new();
		for i in 0..200u32 {
			let (w, h) = (1 + (i * 7) % 13, 1 + (i * 5) % 11);
			if let Some(region) = packer.alloc(w, h) {
				assert!(region.fits_within(64, 64));
				assert!(placed.iter().all(|p| !overlaps(p, &region)));
				placed.push(region);
			}
			if i % 3 == 0 && !placed.is_empty() {
				let victim = placed.remove((i as usize * 31) % placed.len());
				assert!(packer.free(victim));
			}
		}
	}
}
