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

//! Context restore.
//!
//! The dispatcher runs inside an interrupt: switching to the selected thread
//! means restoring its extended state, FS base, TSS kernel stack and page
//! map, then rewriting the interrupt frame so that the `iretq` at the end of
//! the ISR resumes the selected thread instead of the interrupted one.

use crate::{
	arch::x86::{fxrstor, idt::IntFrame, set_fs_base},
	memory,
	process::{scheduler::PerCpu, signal, Thread},
};
use alloc::sync::Arc;

/// Restores `next` on `cpu`, rewriting `frame` with its register snapshot.
///
/// Immediately before the thread re-enters user mode, pending unmasked
/// signals are delivered (unless the owning process is dying).
pub(crate) fn restore(cpu: &PerCpu, next: &Arc<Thread>, frame: &mut IntFrame) {
	fxrstor(&next.fx_state.lock());
	set_fs_base(next.fs_base());
	unsafe {
		cpu.tss().set_kernel_stack(next.kernel_stack_top());
	}
	let proc = next.process();
	if let Some(proc) = &proc {
		let mut regs = next.regs.lock();
		if regs.is_user() && next.has_deliverable_signal() && !proc.is_dying() {
			let _gate = next.gate.lock();
			signal::handle_pending(next, proc, &mut regs);
		}
	}
	// Load the incoming page map; a process without an address space runs on
	// the kernel's
	let root = proc
		.as_ref()
		.and_then(|p| p.address_space().as_ref().map(|space| space.root()))
		.unwrap_or_else(memory::kernel_root);
	memory::bind_root(root);
	*frame = *next.regs.lock();
}
