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

//! Atomic cell holding an optional [`Arc`].
//!
//! Used for each CPU's current thread, which must be readable from the tick
//! path and from the termination rendezvous without taking a lock.

use alloc::sync::Arc;
use core::{
	ptr,
	sync::atomic::{AtomicPtr, Ordering::AcqRel, Ordering::Acquire},
};

/// An atomic cell holding an `Option<Arc<T>>`.
///
/// The cell owns one strong reference to the stored value.
///
/// Loads and swaps are individually atomic. Callers racing a [`get`] against
/// a concurrent [`swap`] must synchronize externally so that the swapped-out
/// value cannot be dropped while the load is in flight; the scheduler
/// guarantees this by only storing a CPU's current thread with that CPU's
/// run-queue lock held.
///
/// [`get`]: AtomicArc::get
/// [`swap`]: AtomicArc::swap
pub struct AtomicArc<T> {
	ptr: AtomicPtr<T>,
}

impl<T> AtomicArc<T> {
	/// Creates an empty cell.
	pub const fn empty() -> Self {
		Self {
			ptr: AtomicPtr::new(ptr::null_mut()),
		}
	}

	/// Returns a new reference to the stored value, if any.
	pub fn get(&self) -> Option<Arc<T>> {
		let ptr = self.ptr.load(Acquire);
		if ptr.is_null() {
			return None;
		}
		unsafe {
			Arc::increment_strong_count(ptr);
			Some(Arc::from_raw(ptr))
		}
	}

	/// Replaces the stored value with `new`, returning the previous one.
	pub fn swap(&self, new: Option<Arc<T>>) -> Option<Arc<T>> {
		let new_ptr = new.map(Arc::into_raw).unwrap_or(ptr::null()) as *mut T;
		let old = self.ptr.swap(new_ptr, AcqRel);
		if old.is_null() {
			None
		} else {
			Some(unsafe { Arc::from_raw(old) })
		}
	}
}

impl<T> Default for AtomicArc<T> {
	fn default() -> Self {
		Self::empty()
	}
}

impl<T> Drop for AtomicArc<T> {
	fn drop(&mut self) {
		self.swap(None);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn get_swap() {
		let cell = AtomicArc::empty();
		assert!(cell.get().is_none());
		let a = Arc::new(7);
		assert!(cell.swap(Some(a.clone())).is_none());
		let b = cell.get().unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		let old = cell.swap(None).unwrap();
		assert!(Arc::ptr_eq(&a, &old));
		assert!(cell.get().is_none());
	}

	#[test]
	fn drop_releases_reference() {
		let a = Arc::new(0);
		{
			let cell = AtomicArc::empty();
			cell.swap(Some(a.clone()));
			assert_eq!(Arc::strong_count(&a), 2);
		}
		assert_eq!(Arc::strong_count(&a), 1);
	}
}
