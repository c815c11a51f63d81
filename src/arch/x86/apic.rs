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

//! Local APIC access: inter-processor interrupts and end-of-interrupt.
//!
//! The scheduler uses a single IPI vector ([`crate::arch::x86::idt::SCHEDULE_VECTOR`])
//! to nudge other cores into running the dispatcher.

use super::idt::SCHEDULE_VECTOR;
use core::sync::atomic::{AtomicUsize, Ordering::Relaxed};

/// APIC register: End of Interrupt
const REG_EOI: usize = 0xb0;
/// APIC register: Interrupt Command Register, low half
const REG_ICR_LOW: usize = 0x300;
/// APIC register: Interrupt Command Register, high half
const REG_ICR_HIGH: usize = 0x310;

/// ICR: level assert
const ICR_ASSERT: u32 = 1 << 14;
/// ICR: destination shorthand, self
const ICR_DSH_SELF: u32 = 0b01 << 18;
/// ICR: destination shorthand, all excluding self
const ICR_DSH_OTHER: u32 = 0b11 << 18;

/// The virtual base address of the local APIC registers, installed by the
/// platform bring-up code. While zero, IPI sends are dropped.
static LAPIC_BASE: AtomicUsize = AtomicUsize::new(0);

/// Installs the virtual base address of the local APIC registers.
pub fn set_lapic_base(base: usize) {
	LAPIC_BASE.store(base, Relaxed);
}

/// Writes a register of the local APIC.
///
/// # Safety
///
/// The caller must ensure the APIC is present, `base` is valid, and `reg` is
/// valid.
unsafe fn write_reg(base: *mut u32, reg: usize, value: u32) {
	base.add(reg / 4).write_volatile(value);
}

/// The destination of an IPI.
#[derive(Clone, Copy, Debug)]
pub enum IpiDest {
	/// The current core.
	Current,
	/// Every core except the current one.
	Others,
	/// The core with the given local APIC ID.
	Target(u8),
}

/// Sends an IPI with the given `vector` to `dest`.
///
/// Until the local APIC base has been installed, the send is dropped.
pub fn send_ipi(dest: IpiDest, vector: u8) {
	let base = LAPIC_BASE.load(Relaxed) as *mut u32;
	if base.is_null() {
		return;
	}
	let (high, low) = match dest {
		IpiDest::Current => (0, ICR_DSH_SELF),
		IpiDest::Others => (0, ICR_DSH_OTHER),
		IpiDest::Target(apic_id) => ((apic_id as u32) << 24, 0),
	};
	unsafe {
		write_reg(base, REG_ICR_HIGH, high);
		// Writing the low half issues the interrupt
		write_reg(base, REG_ICR_LOW, vector as u32 | ICR_ASSERT | low);
	}
}

/// Signals the end of the current interrupt to the local APIC.
pub fn end_of_interrupt() {
	let base = LAPIC_BASE.load(Relaxed) as *mut u32;
	if base.is_null() {
		return;
	}
	unsafe {
		write_reg(base, REG_EOI, 0);
	}
}

/// Returns the local APIC ID of the current core.
#[inline]
pub fn lapic_id() -> u8 {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	{
		let ebx = unsafe { core::arch::x86_64::__cpuid(1) }.ebx;
		(ebx >> 24) as u8
	}
	#[cfg(any(not(target_arch = "x86_64"), test))]
	0
}

/// Raises the schedule interrupt on the current core.
///
/// This is the software path used by [`Yield`](crate::process::scheduler::yield_now):
/// trapping directly into the schedule vector instead of going through the
/// APIC.
pub fn raise_schedule_ipi() {
	const _: () = assert!(SCHEDULE_VECTOR == 0xfd);
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		core::arch::asm!("int 0xfd");
	}
}
