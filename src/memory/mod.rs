/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Sonata.
 *
 * Sonata is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Sonata is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Sonata. If not, see <https://www.gnu.org/licenses/>.
 */

//! Virtual memory: page maps, address spaces and anonymous memory objects.
//!
//! The scheduler treats an address space as opaque. It needs the physical
//! root to load on context switch, a way to fork and destroy spaces, and a
//! way to read and write user memory through the kernel's physical window
//! (initial stack, signal frames, the signal trampoline).
//!
//! Pages are demand-allocated: an anonymous object materializes a frame the
//! first time it is written or explicitly pre-faulted.

use crate::arch::x86::write_cr3;
use alloc::{boxed::Box, vec, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The base virtual address at which anonymous objects are placed.
const ANON_BASE: u64 = 0x7f80_0000_0000;

/// Memory access errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemError {
	/// The accessed range is not mapped in the address space.
	Unmapped,
	/// The requested range overlaps an existing mapping incompatibly.
	Overlap,
}

/// Allocator for page-map root addresses.
static NEXT_ROOT: AtomicU64 = AtomicU64::new(0x10_0000);

/// The top-level page table of an address space.
///
/// The table contents are managed by the paging code; the scheduler only
/// carries the physical root around and loads it into CR3.
pub struct PageMap {
	root: u64,
}

impl PageMap {
	/// Creates a new page map, with the kernel half shared.
	pub fn new() -> Self {
		Self {
			root: NEXT_ROOT.fetch_add(PAGE_SIZE as u64, Relaxed),
		}
	}

	/// Returns the physical address of the page-map root.
	#[inline]
	pub fn root(&self) -> u64 {
		self.root
	}

	/// Loads the page map on the current core.
	#[inline]
	pub fn bind(&self) {
		write_cr3(self.root);
	}
}

impl Default for PageMap {
	fn default() -> Self {
		Self::new()
	}
}

lazy_static::lazy_static! {
	/// The kernel's own page map, bound whenever no user address space is.
	static ref KERNEL_PAGE_MAP: PageMap = PageMap::new();
}

/// Returns the physical root of the kernel's page map.
pub fn kernel_root() -> u64 {
	KERNEL_PAGE_MAP.root()
}

/// Binds the kernel's own page map on the current core.
pub fn bind_kernel() {
	KERNEL_PAGE_MAP.bind();
}

/// Loads the page-map root at physical address `root` on the current core.
pub fn bind_root(root: u64) {
	write_cr3(root);
}

/// An anonymous memory object: a run of demand-allocated frames.
struct VmObject {
	frames: Vec<Option<Box<[u8]>>>,
}

impl VmObject {
	fn new(pages: usize) -> Self {
		let mut frames = Vec::with_capacity(pages);
		frames.resize_with(pages, || None);
		Self {
			frames,
		}
	}

	/// Materializes the frame at `page`, returning it.
	fn materialize(&mut self, page: usize) -> &mut [u8] {
		self.frames[page].get_or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice())
	}

	fn clone_frames(&self) -> Self {
		Self {
			frames: self.frames.clone(),
		}
	}
}

/// An anonymous object mapped at a fixed base in an address space.
struct MappedRegion {
	base: u64,
	object: VmObject,
}

impl MappedRegion {
	#[inline]
	fn size(&self) -> u64 {
		(self.object.frames.len() * PAGE_SIZE) as u64
	}

	#[inline]
	fn contains(&self, addr: u64) -> bool {
		addr >= self.base && addr < self.base + self.size()
	}
}

/// A process's address space.
pub struct AddressSpace {
	page_map: PageMap,
	/// Mapped regions, sorted by base address, non-overlapping.
	regions: Vec<MappedRegion>,
	/// Bump pointer for anonymous placements.
	next_anon: u64,
}

impl AddressSpace {
	/// Creates an empty address space with a fresh page map.
	pub fn new() -> Self {
		Self {
			page_map: PageMap::new(),
			regions: Vec::new(),
			next_anon: ANON_BASE,
		}
	}

	/// Forks the address space.
	///
	/// Frames are duplicated eagerly; a real paging implementation may use
	/// copy-on-write instead, which is transparent to callers.
	pub fn fork(&self) -> Self {
		Self {
			page_map: PageMap::new(),
			regions: self
				.regions
				.iter()
				.map(|r| MappedRegion {
					base: r.base,
					object: r.object.clone_frames(),
				})
				.collect(),
			next_anon: self.next_anon,
		}
	}

	/// Returns the physical root of the space's page map.
	#[inline]
	pub fn root(&self) -> u64 {
		self.page_map.root()
	}

	/// Loads the space's page map on the current core.
	#[inline]
	pub fn bind(&self) {
		self.page_map.bind();
	}

	fn insert_region(&mut self, region: MappedRegion) {
		let i = self
			.regions
			.partition_point(|r| r.base < region.base);
		self.regions.insert(i, region);
	}

	fn region_at(&self, addr: u64) -> Option<&MappedRegion> {
		let i = self.regions.partition_point(|r| r.base <= addr);
		let r = self.regions[..i].last()?;
		r.contains(addr).then_some(r)
	}

	fn region_at_mut(&mut self, addr: u64) -> Option<&mut MappedRegion> {
		let i = self.regions.partition_point(|r| r.base <= addr);
		let r = self.regions[..i].last_mut()?;
		r.contains(addr).then_some(r)
	}

	/// Maps a new anonymous object of `size` bytes (rounded up to the page
	/// size), returning its base address.
	pub fn alloc_anonymous(&mut self, size: usize) -> u64 {
		let pages = size.div_ceil(PAGE_SIZE);
		let base = self.next_anon;
		self.next_anon += (pages * PAGE_SIZE) as u64;
		self.insert_region(MappedRegion {
			base,
			object: VmObject::new(pages),
		});
		base
	}

	/// Maps a new anonymous object covering `[base, base + size)`, both
	/// page-aligned outward.
	///
	/// The range may touch pages already covered by an existing region; only
	/// the uncovered spans are mapped.
	pub fn map_fixed(&mut self, base: u64, size: u64) -> Result<(), MemError> {
		let start = base / PAGE_SIZE as u64;
		let end = (base + size).div_ceil(PAGE_SIZE as u64);
		let mut span_start: Option<u64> = None;
		for page in start..=end {
			let covered = page == end || self.region_at(page * PAGE_SIZE as u64).is_some();
			match (covered, span_start) {
				(false, None) => span_start = Some(page),
				(true, Some(s)) => {
					self.insert_region(MappedRegion {
						base: s * PAGE_SIZE as u64,
						object: VmObject::new((page - s) as usize),
					});
					span_start = None;
				}
				_ => {}
			}
		}
		Ok(())
	}

	/// Pre-faults the page containing `addr`.
	pub fn prefault(&mut self, addr: u64) {
		if let Some(region) = self.region_at_mut(addr) {
			let page = ((addr - region.base) / PAGE_SIZE as u64) as usize;
			region.object.materialize(page);
		}
	}

	/// Materializes every frame of the region containing `base`.
	pub fn force_allocate(&mut self, base: u64) {
		if let Some(region) = self.region_at_mut(base) {
			for page in 0..region.object.frames.len() {
				region.object.materialize(page);
			}
		}
	}

	/// Writes `data` at virtual address `addr`, materializing frames as
	/// needed.
	pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemError> {
		let mut cur = addr;
		let mut rest = data;
		while !rest.is_empty() {
			let region = self.region_at_mut(cur).ok_or(MemError::Unmapped)?;
			let off = (cur - region.base) as usize;
			let page = off / PAGE_SIZE;
			let page_off = off % PAGE_SIZE;
			let n = rest.len().min(PAGE_SIZE - page_off);
			let frame = region.object.materialize(page);
			frame[page_off..page_off + n].copy_from_slice(&rest[..n]);
			cur += n as u64;
			rest = &rest[n..];
		}
		Ok(())
	}

	/// Reads `buf.len()` bytes from virtual address `addr`. Unmaterialized
	/// frames read as zeros.
	pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemError> {
		let mut cur = addr;
		let mut rest = buf;
		while !rest.is_empty() {
			let region = self.region_at(cur).ok_or(MemError::Unmapped)?;
			let off = (cur - region.base) as usize;
			let page = off / PAGE_SIZE;
			let page_off = off % PAGE_SIZE;
			let n = rest.len().min(PAGE_SIZE - page_off);
			let (head, tail) = core::mem::take(&mut rest).split_at_mut(n);
			match &region.object.frames[page] {
				Some(frame) => head.copy_from_slice(&frame[page_off..page_off + n]),
				None => head.fill(0),
			}
			cur += n as u64;
			rest = tail;
		}
		Ok(())
	}
}

impl Default for AddressSpace {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn anonymous_write_read() {
		let mut space = AddressSpace::new();
		let base = space.alloc_anonymous(3 * PAGE_SIZE);
		let data = [0xabu8; 100];
		// Straddle a page boundary
		space.write(base + PAGE_SIZE as u64 - 50, &data).unwrap();
		let mut buf = [0u8; 100];
		space.read(base + PAGE_SIZE as u64 - 50, &mut buf).unwrap();
		assert_eq!(buf, data);
	}

	#[test]
	fn unmapped_access() {
		let mut space = AddressSpace::new();
		assert_eq!(space.write(0xdead_0000, &[1]), Err(MemError::Unmapped));
		let mut buf = [0u8; 1];
		assert_eq!(space.read(0xdead_0000, &mut buf), Err(MemError::Unmapped));
	}

	#[test]
	fn fork_duplicates_frames() {
		let mut space = AddressSpace::new();
		let base = space.alloc_anonymous(PAGE_SIZE);
		space.write(base, b"before").unwrap();
		let forked = space.fork();
		space.write(base, b"after!").unwrap();
		let mut buf = [0u8; 6];
		forked.read(base, &mut buf).unwrap();
		assert_eq!(&buf, b"before");
		assert_ne!(space.root(), forked.root());
	}

	#[test]
	fn map_fixed_skips_covered_pages() {
		let mut space = AddressSpace::new();
		space.map_fixed(0x40_0000, PAGE_SIZE as u64).unwrap();
		// Overlapping request only maps the uncovered tail
		space
			.map_fixed(0x40_0000, 3 * PAGE_SIZE as u64)
			.unwrap();
		space.write(0x40_0000, &[1u8]).unwrap();
		space
			.write(0x40_0000 + 2 * PAGE_SIZE as u64, &[2u8])
			.unwrap();
	}

	#[test]
	fn unwritten_frames_read_zero() {
		let mut space = AddressSpace::new();
		let base = space.alloc_anonymous(PAGE_SIZE);
		let mut buf = [0xffu8; 16];
		space.read(base, &mut buf).unwrap();
		assert_eq!(buf, [0u8; 16]);
	}
}
