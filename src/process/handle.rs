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

//! Per-process kernel-object handles.
//!
//! A handle names a shared kernel object through a small per-process integer.
//! Ids are assigned sequentially from 1 under the table's lock and are stable
//! per slot; destroying a handle vacates its slot without compacting the
//! table, so the table never shrinks.

use crate::sync::IntSpin;
use alloc::{sync::Arc, vec::Vec};

/// Type representing a handle ID. A zero ID denotes a vacated slot.
pub type HandleId = u32;

/// A kernel object referenced by handles.
pub trait KernelObject: Send + Sync {
	/// Releases the resources held by the object.
	///
	/// Called when the owning process is terminated.
	fn destroy(&self);
}

/// Handle lookup and destruction errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleError {
	/// The ID is outside `[1, len]`.
	OutOfRange,
	/// The slot was vacated by a previous destroy.
	Vacated,
}

/// A handle slot.
struct Handle {
	/// The slot's ID; zero when vacated.
	id: HandleId,
	object: Option<Arc<dyn KernelObject>>,
}

/// A process's handle table.
pub struct HandleTable {
	slots: IntSpin<Vec<Handle>>,
}

impl HandleTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self {
			slots: IntSpin::new(Vec::new()),
		}
	}

	/// Registers `object`, returning the assigned ID.
	///
	/// Concurrent registrations are serialized by the table lock, so the IDs
	/// they obtain are all distinct.
	pub fn register(&self, object: Arc<dyn KernelObject>) -> HandleId {
		let mut slots = self.slots.lock();
		let id = slots.len() as HandleId + 1;
		slots.push(Handle {
			id,
			object: Some(object),
		});
		id
	}

	/// Returns the object named by `id`.
	pub fn find(&self, id: HandleId) -> Result<Arc<dyn KernelObject>, HandleError> {
		let slots = self.slots.lock();
		if id < 1 || id as usize > slots.len() {
			return Err(HandleError::OutOfRange);
		}
		let slot = &slots[id as usize - 1];
		slot.object.clone().ok_or(HandleError::Vacated)
	}

	/// Vacates the slot named by `id`, dropping the object reference.
	pub fn destroy(&self, id: HandleId) -> Result<(), HandleError> {
		let mut slots = self.slots.lock();
		if id < 1 || id as usize > slots.len() {
			return Err(HandleError::OutOfRange);
		}
		let slot = &mut slots[id as usize - 1];
		slot.id = 0;
		slot.object = None;
		Ok(())
	}

	/// Calls [`KernelObject::destroy`] on every live object and clears the
	/// table. Used by process termination.
	pub fn destroy_all(&self) {
		let mut slots = self.slots.lock();
		for slot in slots.iter() {
			if slot.id != 0 {
				if let Some(object) = &slot.object {
					object.destroy();
				}
			}
		}
		slots.clear();
	}

	/// Returns the number of slots, vacated included.
	pub fn len(&self) -> usize {
		self.slots.lock().len()
	}

	/// Tells whether the table has no slots.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for HandleTable {
	fn default() -> Self {
		Self::new()
	}
}
