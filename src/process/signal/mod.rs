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

//! Signals.
//!
//! Each process holds one disposition per signal number; each thread holds a
//! pending bitset and a mask bitset. The dispatcher delivers a pending,
//! unmasked signal immediately before context-restoring a thread into user
//! mode: the interrupted context is saved on the user stack and the program
//! counter is rewritten to the per-process signal trampoline, which runs the
//! handler and re-enters the kernel through `sigreturn`.

pub mod trampoline;

use crate::{
	arch::x86::idt::IntFrame,
	process::{reaper, Process, Thread},
};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::{mem::size_of, slice};

/// The number of entries in a process's disposition table.
pub const SIGNAL_MAX: usize = 32;

/// The identifier of the `sigreturn` system call, invoked by the trampoline
/// after the handler returns.
pub const SIGRETURN_ID: u64 = 139;

/// The space kept free below the interrupted stack pointer when building a
/// signal frame, as the System V ABI requires.
const REDZONE_SIZE: u64 = 128;

/// Enumeration of signal types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
	/// Hangup.
	SIGHUP,
	/// Terminal interrupt.
	SIGINT,
	/// Terminal quit.
	SIGQUIT,
	/// Illegal instruction.
	SIGILL,
	/// Trace/breakpoint trap.
	SIGTRAP,
	/// Process abort.
	SIGABRT,
	/// Access to an undefined portion of a memory object.
	SIGBUS,
	/// Erroneous arithmetic operation.
	SIGFPE,
	/// Kill.
	SIGKILL,
	/// User-defined signal 1.
	SIGUSR1,
	/// Invalid memory reference.
	SIGSEGV,
	/// User-defined signal 2.
	SIGUSR2,
	/// Write on a pipe with no one to read it.
	SIGPIPE,
	/// Alarm clock.
	SIGALRM,
	/// Termination.
	SIGTERM,
	/// Child process terminated.
	SIGCHLD,
	/// Continue executing.
	SIGCONT,
	/// Stop executing.
	SIGSTOP,
	/// Terminal stop.
	SIGTSTP,
	/// Background process attempting to read.
	SIGTTIN,
	/// Background process attempting to write.
	SIGTTOU,
	/// High bandwidth data is available at a socket.
	SIGURG,
	/// CPU time limit exceeded.
	SIGXCPU,
	/// File size limit exceeded.
	SIGXFSZ,
	/// Virtual timer expired.
	SIGVTALRM,
	/// Profiling timer expired.
	SIGPROF,
	/// Window resize.
	SIGWINCH,
	/// Pollable event.
	SIGPOLL,
	/// Bad system call.
	SIGSYS,
}

impl TryFrom<u8> for Signal {
	type Error = ();

	fn try_from(id: u8) -> Result<Self, Self::Error> {
		match id {
			1 => Ok(Self::SIGHUP),
			2 => Ok(Self::SIGINT),
			3 => Ok(Self::SIGQUIT),
			4 => Ok(Self::SIGILL),
			5 => Ok(Self::SIGTRAP),
			6 => Ok(Self::SIGABRT),
			7 => Ok(Self::SIGBUS),
			8 => Ok(Self::SIGFPE),
			9 => Ok(Self::SIGKILL),
			10 => Ok(Self::SIGUSR1),
			11 => Ok(Self::SIGSEGV),
			12 => Ok(Self::SIGUSR2),
			13 => Ok(Self::SIGPIPE),
			14 => Ok(Self::SIGALRM),
			15 => Ok(Self::SIGTERM),
			17 => Ok(Self::SIGCHLD),
			18 => Ok(Self::SIGCONT),
			19 => Ok(Self::SIGSTOP),
			20 => Ok(Self::SIGTSTP),
			21 => Ok(Self::SIGTTIN),
			22 => Ok(Self::SIGTTOU),
			23 => Ok(Self::SIGURG),
			24 => Ok(Self::SIGXCPU),
			25 => Ok(Self::SIGXFSZ),
			26 => Ok(Self::SIGVTALRM),
			27 => Ok(Self::SIGPROF),
			28 => Ok(Self::SIGWINCH),
			29 => Ok(Self::SIGPOLL),
			31 => Ok(Self::SIGSYS),
			_ => Err(()),
		}
	}
}

impl Signal {
	/// Returns the signal's number.
	pub const fn id(&self) -> u8 {
		match self {
			Self::SIGHUP => 1,
			Self::SIGINT => 2,
			Self::SIGQUIT => 3,
			Self::SIGILL => 4,
			Self::SIGTRAP => 5,
			Self::SIGABRT => 6,
			Self::SIGBUS => 7,
			Self::SIGFPE => 8,
			Self::SIGKILL => 9,
			Self::SIGUSR1 => 10,
			Self::SIGSEGV => 11,
			Self::SIGUSR2 => 12,
			Self::SIGPIPE => 13,
			Self::SIGALRM => 14,
			Self::SIGTERM => 15,
			Self::SIGCHLD => 17,
			Self::SIGCONT => 18,
			Self::SIGSTOP => 19,
			Self::SIGTSTP => 20,
			Self::SIGTTIN => 21,
			Self::SIGTTOU => 22,
			Self::SIGURG => 23,
			Self::SIGXCPU => 24,
			Self::SIGXFSZ => 25,
			Self::SIGVTALRM => 26,
			Self::SIGPROF => 27,
			Self::SIGWINCH => 28,
			Self::SIGPOLL => 29,
			Self::SIGSYS => 31,
		}
	}

	/// Returns the signal's bit in a pending or mask bitset.
	#[inline]
	pub const fn mask_bit(&self) -> u64 {
		1 << (self.id() - 1)
	}

	/// Returns the default action for the signal.
	pub fn default_action(&self) -> DefaultAction {
		match self {
			Self::SIGCHLD
			| Self::SIGURG
			| Self::SIGWINCH
			| Self::SIGCONT
			| Self::SIGSTOP
			| Self::SIGTSTP
			| Self::SIGTTIN
			| Self::SIGTTOU => DefaultAction::Ignore,
			_ => DefaultAction::Terminate,
		}
	}
}

/// The action taken for a signal whose disposition is `Default`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefaultAction {
	/// Terminate the process.
	Terminate,
	/// Ignore the signal.
	Ignore,
}

/// The action field of a signal disposition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SigAction {
	/// Executes the default action.
	#[default]
	Default,
	/// Ignores the signal.
	Ignore,
	/// Jumps to a user handler through the trampoline.
	UserHandler,
}

bitflags! {
	/// Flags modifying the behaviour of a disposition.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct SigActionFlags: u32 {
		/// The handler takes extended signal information.
		const SA_SIGINFO = 0x00000004;
		/// Interrupted system calls restart after the handler returns.
		const SA_RESTART = 0x10000000;
	}
}

/// A process's disposition for one signal number.
#[derive(Clone, Copy, Debug, Default)]
pub struct SigDisposition {
	/// The action to perform.
	pub action: SigAction,
	/// Behaviour flags.
	pub flags: SigActionFlags,
	/// Signals added to the thread's mask while the handler runs.
	pub mask: u64,
	/// The user-space address of the handler function.
	pub handler: u64,
}

/// The context pushed onto the user stack before jumping to the trampoline,
/// restored by `sigreturn`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigContext {
	/// The interrupted register snapshot.
	pub frame: IntFrame,
	/// The signal mask to restore.
	pub mask: u64,
	/// The delivered signal's number.
	pub sig: u64,
}

/// Returns the highest-priority deliverable signal in `pending & !mask`,
/// lowest number first.
pub fn next_pending(pending: u64, mask: u64) -> Option<Signal> {
	let deliverable = pending & !mask;
	if deliverable == 0 {
		return None;
	}
	Signal::try_from(deliverable.trailing_zeros() as u8 + 1).ok()
}

/// Delivers the highest-priority pending, unmasked signal of `thread` by
/// rewriting `regs`, which is the register snapshot the thread is about to
/// be context-restored from.
///
/// The caller must hold the thread's gate lock, and must only call this on
/// the delivery condition: `regs` returns to user mode, the thread has a
/// deliverable signal and the process is not dying.
pub(crate) fn handle_pending(thread: &Thread, proc: &Arc<Process>, regs: &mut IntFrame) {
	let Some(sig) = next_pending(thread.pending(), thread.sigmask()) else {
		return;
	};
	thread.clear_pending(sig);
	let disposition = proc.signal_disposition(sig);
	match disposition.action {
		SigAction::Ignore => {}
		SigAction::Default => match sig.default_action() {
			DefaultAction::Ignore => {}
			// Termination cannot run from the dispatch path; the reaper
			// performs it from its own thread
			DefaultAction::Terminate => reaper::queue_kill(proc.clone()),
		},
		SigAction::UserHandler => {
			let prev_mask = thread.sigmask();
			let ctx = SigContext {
				frame: *regs,
				mask: prev_mask,
				sig: sig.id() as u64,
			};
			// Build the signal frame below the redzone, 16-byte aligned
			let ctx_base = (regs.rsp - REDZONE_SIZE - size_of::<SigContext>() as u64) & !0xf;
			let bytes = unsafe {
				slice::from_raw_parts(&ctx as *const _ as *const u8, size_of::<SigContext>())
			};
			let mut space = proc.address_space();
			let Some(space) = space.as_mut() else {
				return;
			};
			if space.write(ctx_base, bytes).is_err() {
				log::warn!(
					"dropping signal {} for pid {}: unmapped stack",
					sig.id(),
					proc.pid()
				);
				return;
			}
			thread.raise_sigmask(disposition.mask | sig.mask_bit());
			// Arguments for the trampoline: signal number, handler, context
			regs.rdi = sig.id() as u64;
			regs.rsi = disposition.handler;
			regs.rdx = ctx_base;
			// Keep the handler's entry alignment: the trampoline pushes one
			// word before calling
			regs.rsp = ctx_base - 8;
			regs.rip = proc.signal_trampoline();
		}
	}
}

/// Restores the context saved by signal delivery: the `sigreturn` path.
///
/// `ctx_addr` is the address of the [`SigContext`] the trampoline hands
/// back; `frame` is the system call's interrupt frame, overwritten with the
/// restored context.
pub fn signal_return(
	proc: &Arc<Process>,
	thread: &Thread,
	ctx_addr: u64,
	frame: &mut IntFrame,
) -> Result<(), ()> {
	let mut bytes = [0u8; size_of::<SigContext>()];
	{
		let space = proc.address_space();
		let Some(space) = space.as_ref() else {
			return Err(());
		};
		space.read(ctx_addr, &mut bytes).map_err(|_| ())?;
	}
	let ctx: SigContext = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const _) };
	thread.set_sigmask(ctx.mask);
	*frame = ctx.frame;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numbering_round_trip() {
		for id in 0..=SIGNAL_MAX as u8 {
			if let Ok(sig) = Signal::try_from(id) {
				assert_eq!(sig.id(), id);
			}
		}
		assert!(Signal::try_from(0).is_err());
		assert!(Signal::try_from(16).is_err());
		assert!(Signal::try_from(32).is_err());
	}

	#[test]
	fn next_pending_priority() {
		let pending = Signal::SIGTERM.mask_bit() | Signal::SIGHUP.mask_bit();
		// Lowest numbered signal wins
		assert_eq!(next_pending(pending, 0), Some(Signal::SIGHUP));
		// Masking the winner moves to the next
		assert_eq!(
			next_pending(pending, Signal::SIGHUP.mask_bit()),
			Some(Signal::SIGTERM)
		);
		assert_eq!(next_pending(pending, pending), None);
		assert_eq!(next_pending(0, 0), None);
	}

	#[test]
	fn sigchld_defaults_to_ignore() {
		assert_eq!(Signal::SIGCHLD.default_action(), DefaultAction::Ignore);
		assert_eq!(Signal::SIGTERM.default_action(), DefaultAction::Terminate);
	}

	use crate::{
		arch::x86::{USER_CS, USER_SS},
		memory::AddressSpace,
		process::{scheduler, tests::world_lock},
	};

	/// Builds a process with a mapped user stack and a trampoline address,
	/// returning `(process, stack_top)`.
	fn user_process() -> (alloc::sync::Arc<Process>, u64) {
		let proc = Process::initialize_empty();
		let mut space = AddressSpace::new();
		let stack_base = space.alloc_anonymous(0x10000);
		let stack_top = stack_base + 0x10000;
		*proc.address_space() = Some(space);
		proc.set_signal_trampoline(0x7fff_0000);
		(proc, stack_top)
	}

	#[test]
	fn delivery_rewrites_context_and_masks() {
		let _guard = world_lock();
		let (proc, stack_top) = user_process();
		proc.set_signal_disposition(
			Signal::SIGUSR1,
			SigDisposition {
				action: SigAction::UserHandler,
				flags: SigActionFlags::empty(),
				mask: Signal::SIGTERM.mask_bit(),
				handler: 0x5000,
			},
		);
		let thread = proc.main_thread();
		thread.signal(Signal::SIGUSR1);
		let mut regs = IntFrame::new_with_segments(0x40_1000, stack_top, USER_CS, USER_SS);
		let saved = regs;
		handle_pending(&thread, &proc, &mut regs);
		// The program counter now points at the trampoline, with the
		// handler and context as arguments
		assert_eq!(regs.rip, proc.signal_trampoline());
		assert_eq!(regs.rdi, Signal::SIGUSR1.id() as u64);
		assert_eq!(regs.rsi, 0x5000);
		assert_eq!(regs.rsp, regs.rdx - 8);
		assert_eq!(regs.rdx % 16, 0);
		// The pending bit is cleared; the disposition's mask and the
		// signal's own bit are raised until sigreturn
		assert_eq!(thread.pending() & Signal::SIGUSR1.mask_bit(), 0);
		assert_eq!(
			thread.sigmask(),
			Signal::SIGTERM.mask_bit() | Signal::SIGUSR1.mask_bit()
		);
		// sigreturn restores the interrupted context and the old mask
		let mut frame = IntFrame::default();
		signal_return(&proc, &thread, regs.rdx, &mut frame).unwrap();
		assert_eq!(frame, saved);
		assert_eq!(thread.sigmask(), 0);
	}

	#[test]
	fn ignored_dispositions_consume_the_signal() {
		let _guard = world_lock();
		let (proc, stack_top) = user_process();
		let thread = proc.main_thread();
		// SIGCHLD: default disposition, default action is to ignore
		thread.signal(Signal::SIGCHLD);
		let mut regs = IntFrame::new_with_segments(0x40_1000, stack_top, USER_CS, USER_SS);
		let saved = regs;
		handle_pending(&thread, &proc, &mut regs);
		assert_eq!(regs, saved);
		assert_eq!(thread.pending(), 0);
		assert_eq!(thread.sigmask(), 0);
	}

	#[test]
	fn dispatcher_delivers_before_user_mode() {
		let _guard = world_lock();
		let cpus = scheduler::tests::fresh_cpus();
		let (proc, stack_top) = user_process();
		proc.set_signal_disposition(
			Signal::SIGUSR2,
			SigDisposition {
				action: SigAction::UserHandler,
				flags: SigActionFlags::empty(),
				mask: 0,
				handler: 0x6000,
			},
		);
		let thread = proc.main_thread();
		*thread.regs.lock() =
			IntFrame::new_with_segments(0x40_1000, stack_top, USER_CS, USER_SS);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(thread.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		scheduler::schedule(&mut frame);
		scheduler::schedule(&mut frame);
		assert!(alloc::sync::Arc::ptr_eq(
			&cpus[0].current.get().unwrap(),
			&thread
		));
		// Nothing pending yet: the thread resumes where it was interrupted
		assert_eq!(frame.rip, 0x40_1000);
		// A signal raised while the thread is current is delivered at the
		// next dispatch, before any further user instruction
		thread.signal(Signal::SIGUSR2);
		thread.set_time_slice(0);
		scheduler::schedule(&mut frame);
		assert_eq!(frame.rip, proc.signal_trampoline());
		assert_eq!(frame.rdi, Signal::SIGUSR2.id() as u64);
		scheduler::tests::fresh_cpus();
	}
}
