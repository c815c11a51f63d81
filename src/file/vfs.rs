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

//! The virtual filesystem: a flat registry of nodes.
//!
//! Filesystem drivers register the nodes they serve; the kernel resolves
//! absolute paths against the registry. The two device nodes the scheduler
//! depends on (`/dev/null` and `/dev/kernellog`) are registered by [`init`].

use crate::logger;
use alloc::{
	string::{String, ToString},
	sync::Arc,
	vec,
	vec::Vec,
};
use spin::{Mutex, Once};

/// Node operations, implemented by filesystem drivers and devices.
pub trait NodeOps: Send + Sync {
	/// Returns the size of the node's content in bytes.
	fn size(&self) -> usize {
		0
	}

	/// Reads at `off` into `buf`, returning the number of bytes read.
	fn read(&self, off: usize, buf: &mut [u8]) -> usize;

	/// Writes `data` at `off`, returning the number of bytes written.
	fn write(&self, off: usize, data: &[u8]) -> usize;
}

/// A filesystem node.
pub struct Node {
	path: String,
	ops: alloc::boxed::Box<dyn NodeOps>,
}

impl Node {
	/// Returns the absolute path the node is registered under.
	#[inline]
	pub fn path(&self) -> &str {
		&self.path
	}

	/// Returns the size of the node's content in bytes.
	#[inline]
	pub fn size(&self) -> usize {
		self.ops.size()
	}

	/// Reads at `off` into `buf`, returning the number of bytes read.
	#[inline]
	pub fn read(&self, off: usize, buf: &mut [u8]) -> usize {
		self.ops.read(off, buf)
	}

	/// Writes `data` at `off`, returning the number of bytes written.
	#[inline]
	pub fn write(&self, off: usize, data: &[u8]) -> usize {
		self.ops.write(off, data)
	}
}

lazy_static::lazy_static! {
	/// The node registry.
	static ref NODES: Mutex<Vec<Arc<Node>>> = Mutex::new(Vec::new());
}

/// Guard ensuring the device nodes are registered once.
static DEVFS_INIT: Once = Once::new();

/// The null device: reads end-of-file, writes are discarded.
struct NullDevice;

impl NodeOps for NullDevice {
	fn read(&self, _off: usize, _buf: &mut [u8]) -> usize {
		0
	}

	fn write(&self, _off: usize, data: &[u8]) -> usize {
		data.len()
	}
}

/// The kernel log device, backed by the logger's ring buffer.
struct KernelLogDevice;

impl NodeOps for KernelLogDevice {
	fn read(&self, off: usize, buf: &mut [u8]) -> usize {
		logger::read_ring(off, buf)
	}

	fn write(&self, _off: usize, data: &[u8]) -> usize {
		logger::write_bytes(data);
		data.len()
	}
}

/// A read-only in-memory file, used for initrd content.
struct RamFile(Vec<u8>);

impl NodeOps for RamFile {
	fn size(&self) -> usize {
		self.0.len()
	}

	fn read(&self, off: usize, buf: &mut [u8]) -> usize {
		let Some(src) = self.0.get(off..) else {
			return 0;
		};
		let n = buf.len().min(src.len());
		buf[..n].copy_from_slice(&src[..n]);
		n
	}

	fn write(&self, _off: usize, _data: &[u8]) -> usize {
		0
	}
}

/// Registers the built-in device nodes.
pub fn init() {
	DEVFS_INIT.call_once(|| {
		register_node("/dev/null", alloc::boxed::Box::new(NullDevice));
		register_node("/dev/kernellog", alloc::boxed::Box::new(KernelLogDevice));
	});
}

/// Registers a node at the given absolute `path`, returning it.
///
/// A node already registered at the same path is replaced.
pub fn register_node(path: &str, ops: alloc::boxed::Box<dyn NodeOps>) -> Arc<Node> {
	let node = Arc::new(Node {
		path: path.to_string(),
		ops,
	});
	let mut nodes = NODES.lock();
	nodes.retain(|n| n.path != path);
	nodes.push(node.clone());
	node
}

/// Registers a read-only in-memory file at `path`.
pub fn register_file(path: &str, data: Vec<u8>) -> Arc<Node> {
	register_node(path, alloc::boxed::Box::new(RamFile(data)))
}

/// Resolves an absolute path to a node.
pub fn resolve_path(path: &str) -> Option<Arc<Node>> {
	NODES.lock().iter().find(|n| n.path == path).cloned()
}

/// Reads the whole content of `node`.
pub fn read_all(node: &Arc<Node>) -> Vec<u8> {
	let mut buf = vec![0u8; node.size()];
	let n = node.read(0, &mut buf);
	buf.truncate(n);
	buf
}
