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

//! Task State Segment handling.
//!
//! On context switch, the dispatcher points the TSS's privilege-0 stack slot
//! at the incoming thread's kernel stack, so that interrupts taken from user
//! mode land on the right stack.

use x86_64::{structures::tss::TaskStateSegment, VirtAddr};

/// A CPU's Task State Segment. Installed into the GDT by the platform
/// bring-up code.
pub struct Tss(TaskStateSegment);

impl Tss {
	/// Creates a zeroed TSS.
	pub fn new() -> Self {
		Self(TaskStateSegment::new())
	}

	/// Sets the stack used when entering ring 0.
	#[inline]
	pub fn set_kernel_stack(&mut self, stack_top: u64) {
		self.0.privilege_stack_table[0] = VirtAddr::new_truncate(stack_top);
	}

	/// Returns the stack used when entering ring 0.
	#[inline]
	pub fn kernel_stack(&self) -> u64 {
		self.0.privilege_stack_table[0].as_u64()
	}
}

impl Default for Tss {
	fn default() -> Self {
		Self::new()
	}
}
