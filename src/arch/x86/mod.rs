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

//! x86-specific code.
//!
//! Every privileged instruction the kernel uses goes through this module. In
//! hosted test builds the wrappers compile to no-ops so that the scheduler
//! logic above them can run as ordinary unit tests.

pub mod apic;
pub mod idt;
pub mod smp;
pub mod tss;

/// The kernel code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// The kernel data segment selector.
pub const KERNEL_SS: u64 = 0x10;
/// The user code segment selector (RPL 3).
pub const USER_CS: u64 = 0x23;
/// The user data segment selector (RPL 3).
pub const USER_SS: u64 = 0x1b;

/// Default `rflags` for a new thread. Bit 9 is the interrupt flag.
pub const DEFAULT_RFLAGS: u64 = 0x202;
/// Default FPU control word for a new thread.
pub const DEFAULT_FCW: u16 = 0x33f;
/// Default MXCSR (SSE control word) for a new thread.
pub const DEFAULT_MXCSR: u32 = 0x1f80;
/// Default MXCSR mask for a new thread.
pub const DEFAULT_MXCSR_MASK: u32 = 0xffbf;

#[cfg(test)]
thread_local! {
	/// Emulated interrupt flag for hosted tests.
	static INT_FLAG: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

/// Tells whether maskable interrupts are enabled on the current core.
#[inline]
pub fn is_interrupt_enabled() -> bool {
	#[cfg(test)]
	{
		INT_FLAG.with(|f| f.get())
	}
	#[cfg(not(test))]
	{
		x86_64::instructions::interrupts::are_enabled()
	}
}

/// Disables maskable interrupts on the current core.
#[inline(always)]
pub fn cli() {
	#[cfg(test)]
	INT_FLAG.with(|f| f.set(false));
	#[cfg(not(test))]
	x86_64::instructions::interrupts::disable();
}

/// Enables maskable interrupts on the current core.
#[inline(always)]
pub fn sti() {
	#[cfg(test)]
	INT_FLAG.with(|f| f.set(true));
	#[cfg(not(test))]
	x86_64::instructions::interrupts::enable();
}

/// Waits for an interruption on the current core.
#[inline(always)]
pub fn hlt() {
	#[cfg(test)]
	core::hint::spin_loop();
	#[cfg(not(test))]
	x86_64::instructions::hlt();
}

/// Programs the FS base of the current core.
#[inline]
pub fn set_fs_base(base: u64) {
	#[cfg(test)]
	let _ = base;
	#[cfg(not(test))]
	x86_64::registers::model_specific::FsBase::write(x86_64::VirtAddr::new_truncate(base));
}

/// Loads the page-map root at physical address `root` into CR3.
#[inline]
pub fn write_cr3(root: u64) {
	#[cfg(test)]
	let _ = root;
	#[cfg(not(test))]
	{
		use x86_64::{
			registers::control::{Cr3, Cr3Flags},
			structures::paging::PhysFrame,
			PhysAddr,
		};
		let frame = PhysFrame::containing_address(PhysAddr::new_truncate(root));
		unsafe {
			Cr3::write(frame, Cr3Flags::empty());
		}
	}
}

/// FPU/SSE extended-state block.
///
/// One page per thread, 16-byte aligned as `fxsave64` requires; the
/// instruction uses the first 512 bytes.
#[repr(C, align(4096))]
pub struct FxState(pub [u8; 4096]);

impl FxState {
	/// Creates a zeroed block carrying the default FPU and SSE control words.
	pub fn new() -> Self {
		let mut state = Self([0; 4096]);
		state.0[0..2].copy_from_slice(&DEFAULT_FCW.to_le_bytes());
		state.0[24..28].copy_from_slice(&DEFAULT_MXCSR.to_le_bytes());
		state.0[28..32].copy_from_slice(&DEFAULT_MXCSR_MASK.to_le_bytes());
		state
	}
}

impl Default for FxState {
	fn default() -> Self {
		Self::new()
	}
}

/// Saves the current x87 FPU, MMX and SSE state to the given block.
#[inline]
pub fn fxsave(fxstate: &mut FxState) {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		core::arch::asm!("fxsave64 [{}]", in(reg) fxstate.0.as_mut_ptr());
	}
	#[cfg(any(not(target_arch = "x86_64"), test))]
	let _ = fxstate;
}

/// Restores the x87 FPU, MMX and SSE state from the given block.
#[inline]
pub fn fxrstor(fxstate: &FxState) {
	#[cfg(all(target_arch = "x86_64", not(test)))]
	unsafe {
		core::arch::asm!("fxrstor64 [{}]", in(reg) fxstate.0.as_ptr());
	}
	#[cfg(any(not(target_arch = "x86_64"), test))]
	let _ = fxstate;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fx_state_defaults() {
		let state = FxState::new();
		assert_eq!(u16::from_le_bytes([state.0[0], state.0[1]]), DEFAULT_FCW);
		let mxcsr = u32::from_le_bytes(state.0[24..28].try_into().unwrap());
		assert_eq!(mxcsr, DEFAULT_MXCSR);
		let mask = u32::from_le_bytes(state.0[28..32].try_into().unwrap());
		assert_eq!(mask, DEFAULT_MXCSR_MASK);
	}
}
