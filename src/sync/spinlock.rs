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

//! Interrupt-masking spinlock.
//!
//! One particularity with kernel development is that multi-threading is not
//! the only way to get concurrency issues: an interruption may be triggered
//! at any moment. An [`IntSpin`] masks maskable interrupts for as long as it
//! is held, restoring the previous interrupt state on release.

use crate::arch::x86::{cli, is_interrupt_enabled, sti};
use core::{
	fmt,
	fmt::Formatter,
	hint,
	mem::ManuallyDrop,
	ops::{Deref, DerefMut},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// Unlocks the associated [`IntSpin`] when dropped, restoring the interrupt
/// state captured at acquisition.
pub struct IntSpinGuard<'m, T: ?Sized> {
	guard: ManuallyDrop<SpinMutexGuard<'m, T>>,
	/// The interrupt state before locking.
	int_state: bool,
}

impl<T: ?Sized> Deref for IntSpinGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		&self.guard
	}
}

impl<T: ?Sized> DerefMut for IntSpinGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.guard
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IntSpinGuard<'_, T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.deref(), f)
	}
}

impl<T: ?Sized> Drop for IntSpinGuard<'_, T> {
	fn drop(&mut self) {
		// Release the lock before re-enabling interrupts
		unsafe {
			ManuallyDrop::drop(&mut self.guard);
		}
		if self.int_state {
			sti();
		}
	}
}

/// A spinlock that masks interrupts while held.
pub struct IntSpin<T: ?Sized> {
	inner: SpinMutex<T>,
}

impl<T> IntSpin<T> {
	/// Creates a new instance wrapping the given `data`.
	pub const fn new(data: T) -> Self {
		Self {
			inner: SpinMutex::new(data),
		}
	}
}

impl<T: Default> Default for IntSpin<T> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}

impl<T: ?Sized> IntSpin<T> {
	/// Acquires the spinlock, disabling interrupts first.
	///
	/// Interrupts stay masked for the whole wait. This is the discipline for
	/// locks that are only contended briefly, and for a CPU's own run queue.
	pub fn lock(&self) -> IntSpinGuard<'_, T> {
		let int_state = is_interrupt_enabled();
		cli();
		IntSpinGuard {
			guard: ManuallyDrop::new(self.inner.lock()),
			int_state,
		}
	}

	/// Acquires the spinlock with interrupts enabled during the wait,
	/// disabling them only once the lock is held.
	///
	/// This is the discipline for mutating a *remote* CPU's run queue: the
	/// local CPU must keep taking ticks while it waits for the remote lock.
	pub fn lock_remote(&self) -> IntSpinGuard<'_, T> {
		let int_state = is_interrupt_enabled();
		sti();
		let guard = loop {
			match self.inner.try_lock() {
				Some(guard) => break guard,
				None => hint::spin_loop(),
			}
		};
		cli();
		IntSpinGuard {
			guard: ManuallyDrop::new(guard),
			int_state,
		}
	}

	/// Attempts to acquire the spinlock without blocking.
	///
	/// On success, interrupts are masked as with [`lock`](Self::lock). On
	/// failure, the interrupt state is left untouched and `None` is returned.
	pub fn try_lock(&self) -> Option<IntSpinGuard<'_, T>> {
		let int_state = is_interrupt_enabled();
		cli();
		match self.inner.try_lock() {
			Some(guard) => Some(IntSpinGuard {
				guard: ManuallyDrop::new(guard),
				int_state,
			}),
			None => {
				if int_state {
					sti();
				}
				None
			}
		}
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IntSpin<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.inner, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_unlock() {
		let spin = IntSpin::new(0usize);
		{
			let mut guard = spin.lock();
			*guard += 1;
		}
		assert_eq!(*spin.lock(), 1);
	}

	#[test]
	fn try_lock_contended() {
		let spin = IntSpin::new(());
		let guard = spin.lock();
		assert!(spin.try_lock().is_none());
		drop(guard);
		assert!(spin.try_lock().is_some());
	}

	#[test]
	fn lock_remote_uncontended() {
		let spin = IntSpin::new(42u32);
		assert_eq!(*spin.lock_remote(), 42);
	}
}
