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

//! The signal trampoline.
//!
//! A fixed machine-code blob copied into each user address space at process
//! creation, into a dedicated anonymous region. Signal delivery rewrites the
//! thread's program counter to it with:
//! - `rdi`: the signal number
//! - `rsi`: the handler's address
//! - `rdx`: the address of the saved [`SigContext`](super::SigContext)
//!
//! The trampoline calls the handler, then re-enters the kernel through the
//! `sigreturn` system call to restore the interrupted context.

use crate::{arch::x86::idt::SYSCALL_VECTOR, process::signal::SIGRETURN_ID};

// The literals below must match `SYSCALL_VECTOR` and `SIGRETURN_ID`
const _: () = assert!(SYSCALL_VECTOR == 0x69);
const _: () = assert!(SIGRETURN_ID == 139);

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
	r#"
.section .rodata
.global signal_trampoline_start
.global signal_trampoline_end
signal_trampoline_start:
	push rdx
	mov rax, rsi
	mov rsi, rdx
	call rax
	pop rdi
	mov rax, 139
	int 0x69
	ud2
signal_trampoline_end:
.text
"#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
	static signal_trampoline_start: u8;
	static signal_trampoline_end: u8;
}

/// Returns the trampoline's machine code.
pub fn bytes() -> &'static [u8] {
	#[cfg(target_arch = "x86_64")]
	unsafe {
		let start = &signal_trampoline_start as *const u8;
		let end = &signal_trampoline_end as *const u8;
		core::slice::from_raw_parts(start, end.offset_from(start) as usize)
	}
	#[cfg(not(target_arch = "x86_64"))]
	&[]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blob_is_present() {
		let blob = bytes();
		assert!(!blob.is_empty());
		// Fits comfortably in the single page the exec path maps for it
		assert!(blob.len() < crate::memory::PAGE_SIZE);
		// Ends with ud2 (0x0f 0x0b): control must never fall through
		assert_eq!(&blob[blob.len() - 2..], &[0x0f, 0x0b]);
	}
}
