//! Virtual range allocator.
//!
//! [RangeAllocator] doesn't manage any memory itself, it keeps track of which byte ranges of one
//! fixed-size block are in use. Pools put one of these in front of every device buffer they own.

use std::ops::Range as StdRange;

/// One contiguous run of bytes inside a block, either handed out or free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Range {
	pub offset: u64,
	pub size: u64,
	pub allocated: bool,
}

impl Range {
	pub fn end(&self) -> u64 {
		self.offset + self.size
	}
}

/// Rounds `value` up to a multiple of `align`. Any alignment works; 0 is treated as 1.
pub fn round_up(value: u64, align: u64) -> u64 {
	let align = align.max(1);
	match value % align {
		0 => value,
		rem => value + (align - rem),
	}
}

/// First-fit allocator over `[0, size)`.
///
/// Ranges are kept sorted by offset and always cover the whole block with no gaps. Freed ranges
/// aren't merged with their neighbours right away: merging happens when an allocation fails while
/// there are unmerged frees, or when [RangeAllocator::merge] is called.
#[derive(Clone, Debug)]
pub struct RangeAllocator {
	size: u64,
	ranges: Vec<Range>,
	allocated_bytes: u64,
	needs_merge: bool,
}

impl RangeAllocator {
	pub fn new(size: u64) -> Self {
		let mut allocator = RangeAllocator {
			size,
			ranges: Vec::new(),
			allocated_bytes: 0,
			needs_merge: false,
		};
		allocator.reset();
		allocator
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	/// Reserves `size` bytes at an offset that is a multiple of `align` and returns that offset, or
	/// `None` if no free range can hold it.
	pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
		if size == 0 {
			return None;
		}
		if let Some(offset) = self.first_fit(size, align) {
			return Some(offset);
		}
		if self.needs_merge {
			self.merge();
			return self.first_fit(size, align);
		}
		None
	}

	fn first_fit(&mut self, size: u64, align: u64) -> Option<u64> {
		let (index, aligned) = self.ranges.iter().enumerate().find_map(|(i, range)| {
			if range.allocated {
				return None;
			}
			let aligned = round_up(range.offset, align);
			match aligned.checked_add(size) {
				Some(end) if end <= range.end() => Some((i, aligned)),
				_ => None,
			}
		})?;

		let mut index = index;
		let found = self.ranges[index];
		// Padding in front stays behind as its own free range.
		if aligned > found.offset {
			self.ranges[index].size = aligned - found.offset;
			index += 1;
			self.ranges.insert(
				index,
				Range {
					offset: aligned,
					size: found.end() - aligned,
					allocated: false,
				},
			);
		}
		let remaining = self.ranges[index].size - size;
		if remaining > 0 {
			self.ranges[index].size = size;
			self.ranges.insert(
				index + 1,
				Range {
					offset: aligned + size,
					size: remaining,
					allocated: false,
				},
			);
		}
		self.ranges[index].allocated = true;
		self.allocated_bytes += size;
		Some(aligned)
	}

	/// Releases the allocation starting at `offset`. Returns false if nothing was allocated there.
	pub fn free(&mut self, offset: u64) -> bool {
		match self.ranges.binary_search_by_key(&offset, |range| range.offset) {
			Ok(index) if self.ranges[index].allocated => {
				self.ranges[index].allocated = false;
				self.allocated_bytes -= self.ranges[index].size;
				self.needs_merge = true;
				true
			}
			_ => false,
		}
	}

	/// Coalesces adjacent free ranges. Calling it again without an intervening free does nothing.
	pub fn merge(&mut self) {
		if !self.needs_merge {
			return;
		}
		let mut merged: Vec<Range> = Vec::with_capacity(self.ranges.len());
		for range in self.ranges.drain(..) {
			if let Some(last) = merged.last_mut() {
				if !last.allocated && !range.allocated {
					last.size += range.size;
					continue;
				}
			}
			merged.push(range);
		}
		self.ranges = merged;
		self.needs_merge = false;
	}

	/// Forgets every allocation.
	pub fn reset(&mut self) {
		self.ranges.clear();
		if self.size > 0 {
			self.ranges.push(Range {
				offset: 0,
				size: self.size,
				allocated: false,
			});
		}
		self.allocated_bytes = 0;
		self.needs_merge = false;
	}

	/// Extends the tracked block to `new_size`, keeping every allocation where it is.
	pub fn grow(&mut self, new_size: u64) {
		assert!(new_size >= self.size, "tried to shrink a range allocator from {} to {}", self.size, new_size);
		let extra = new_size - self.size;
		if extra == 0 {
			return;
		}
		match self.ranges.last_mut() {
			Some(last) if !last.allocated => last.size += extra,
			_ => self.ranges.push(Range {
				offset: self.size,
				size: extra,
				allocated: false,
			}),
		}
		self.size = new_size;
	}

	/// The smallest byte range covering every live allocation, or `None` if there are none.
	pub fn live_span(&self) -> Option<StdRange<u64>> {
		let first = self.ranges.iter().find(|r| r.allocated)?;
		let last = self.ranges.iter().rev().find(|r| r.allocated)?;
		Some(first.offset..last.end())
	}

	pub fn allocated_bytes(&self) -> u64 {
		self.allocated_bytes
	}

	pub fn is_empty(&self) -> bool {
		self.allocated_bytes == 0
	}

	pub fn ranges(&self) -> &[Range] {
		&self.ranges
	}

	/// Test function: returns the block as a `Vec<usize>` with each byte set to the 1-based index of
	/// the allocation covering it (in offset order), or `0` if it's free.
	#[cfg(test)]
	fn _test_get_arena(&self) -> Vec<usize> {
		let mut arena = vec![0; self.size as usize];
		let allocated = self.ranges.iter().filter(|r| r.allocated);
		for (id, range) in allocated.enumerate() {
			for byte in range.offset..range.end() {
				arena[byte as usize] = id + 1;
			}
		}
		arena
	}
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////
