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

//! Files.
//!
//! The scheduler consumes a narrow byte-level read path from the filesystem:
//! resolve a path to a node, read bytes from it, open it as a descriptor.

pub mod vfs;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};
use vfs::Node;

/// An open file description, referenced from a process's descriptor table.
pub struct FileDescriptor {
	node: Arc<Node>,
	offset: AtomicU64,
}

impl FileDescriptor {
	/// Opens `node` at offset zero.
	pub fn open(node: Arc<Node>) -> Arc<Self> {
		Arc::new(Self {
			node,
			offset: AtomicU64::new(0),
		})
	}

	/// Returns the underlying node.
	#[inline]
	pub fn node(&self) -> &Arc<Node> {
		&self.node
	}

	/// Reads from the current offset, advancing it.
	pub fn read(&self, buf: &mut [u8]) -> usize {
		let off = self.offset.load(Relaxed);
		let n = self.node.read(off as usize, buf);
		self.offset.fetch_add(n as u64, Relaxed);
		n
	}

	/// Writes at the current offset, advancing it.
	pub fn write(&self, data: &[u8]) -> usize {
		let off = self.offset.load(Relaxed);
		let n = self.node.write(off as usize, data);
		self.offset.fetch_add(n as u64, Relaxed);
		n
	}
}
