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

//! Threads.
//!
//! A thread is the unit of scheduling: it carries the full architectural
//! register snapshot, the FPU/SSE extended-state block, a dedicated kernel
//! stack, its scheduling attributes and its signal bitsets. Threads of one
//! CPU form an intrusive circular list inside that CPU's run queue.

use crate::{
	arch::x86::{fxsave, idt::IntFrame, FxState},
	process::{
		blocker::{BlockOutcome, Blocker},
		scheduler, Process,
	},
	sync::IntSpin,
	time,
};
use alloc::{
	boxed::Box,
	sync::{Arc, Weak},
	vec,
};
use core::{
	cell::UnsafeCell,
	ptr,
	sync::atomic::{
		AtomicU32, AtomicU64, AtomicU8,
		Ordering::{Relaxed, SeqCst},
	},
};
use spin::Mutex;

/// Type representing a thread ID, unique within its process.
pub type Tid = u64;

/// The size of a thread's kernel stack: 32 pages.
pub const KERNEL_STACK_SIZE: usize = 128 * 1024;
/// The default time slice of a runnable thread, in timer ticks.
pub const DEFAULT_TIME_SLICE: u32 = 4;
/// The scheduling priority of user threads.
pub const USER_PRIORITY: u8 = 4;
/// The scheduling priority of idle threads.
pub const IDLE_PRIORITY: u8 = 1;

/// An enumeration containing possible states for a thread.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
	/// The thread is running or waiting to run.
	Running = 0,
	/// The thread is waiting on a blocker and must not be dispatched.
	Blocked = 1,
	/// The thread belongs to a terminating process.
	Zombie = 2,
	/// The thread is dispatched at most once more, so its CPU can surrender
	/// it to the reaper.
	Dying = 3,
}

impl ThreadState {
	fn from_id(id: u8) -> Self {
		match id {
			0 => Self::Running,
			1 => Self::Blocked,
			2 => Self::Zombie,
			3 => Self::Dying,
			_ => unreachable!(),
		}
	}
}

/// A thread's dedicated kernel stack, freed with the thread.
pub(crate) struct KernelStack(Box<[u8]>);

impl KernelStack {
	/// Allocates a zeroed stack.
	fn new() -> Self {
		Self(vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice())
	}

	/// Returns the address of the top of the stack.
	#[inline]
	pub fn top(&self) -> u64 {
		self.0.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
	}
}

/// State guarded by the per-thread lock: the blocker hook and, through the
/// lock itself, the signal-delivery path.
pub(crate) struct ThreadGate {
	/// The blocker the thread is currently waiting on, if any.
	pub blocker: Option<Arc<dyn Blocker>>,
}

/// The intrusive links chaining a thread into its CPU's run-queue ring.
///
/// Only the owning run queue touches these, under its lock.
pub(crate) struct QueueLinks(UnsafeCell<(*const Thread, *const Thread)>);

impl QueueLinks {
	fn new() -> Self {
		Self(UnsafeCell::new((ptr::null(), ptr::null())))
	}

	/// Returns `(prev, next)`.
	///
	/// # Safety
	///
	/// The owning run queue's lock must be held.
	pub unsafe fn get(&self) -> (*const Thread, *const Thread) {
		*self.0.get()
	}

	/// Sets `(prev, next)`.
	///
	/// # Safety
	///
	/// The owning run queue's lock must be held.
	pub unsafe fn set(&self, prev: *const Thread, next: *const Thread) {
		*self.0.get() = (prev, next);
	}
}

/// The **Thread Control Block**.
pub struct Thread {
	/// The thread's ID, unique within its process.
	tid: Tid,
	/// The owning process. Non-owning back-reference.
	process: Weak<Process>,
	/// The thread's scheduling priority.
	priority: AtomicU8,

	/// The thread's state.
	state: AtomicU8,
	/// The time slice reloaded on each dispatch, in ticks.
	default_time_slice: AtomicU32,
	/// The remaining time slice, in ticks.
	time_slice: AtomicU32,

	/// The saved register snapshot.
	pub(crate) regs: IntSpin<IntFrame>,
	/// The FPU/SSE extended-state block.
	pub(crate) fx_state: IntSpin<Box<FxState>>,
	/// The thread's kernel stack.
	kernel_stack: KernelStack,
	/// The base of the user stack region.
	user_stack_base: AtomicU64,
	/// The limit of the user stack region.
	user_stack_limit: AtomicU64,
	/// The FS segment base, restored on dispatch.
	fs_base: AtomicU64,

	/// Pending-signal bitset. Bit `n - 1` stands for signal `n`.
	pending: AtomicU64,
	/// Signal mask bitset.
	sigmask: AtomicU64,
	/// The per-thread lock guarding the blocker and signal-delivery paths.
	///
	/// A plain spinlock: termination holds it across its drain sleep, so it
	/// must not mask interrupts.
	pub(crate) gate: Mutex<ThreadGate>,

	/// Intrusive run-queue links.
	pub(crate) links: QueueLinks,
}

// Safety: the raw pointers in `links` are guarded by the owning run queue's
// lock; everything else is atomics or locks.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
	/// Creates a thread owned by `process`, with the given register snapshot.
	///
	/// The thread is not placed on any run queue.
	pub(crate) fn new(
		process: &Weak<Process>,
		tid: Tid,
		priority: u8,
		time_slice: u32,
		regs: IntFrame,
	) -> Arc<Self> {
		Arc::new(Self {
			tid,
			process: process.clone(),
			priority: AtomicU8::new(priority),

			state: AtomicU8::new(ThreadState::Running as _),
			default_time_slice: AtomicU32::new(time_slice),
			time_slice: AtomicU32::new(time_slice),

			regs: IntSpin::new(regs),
			fx_state: IntSpin::new(Box::new(FxState::new())),
			kernel_stack: KernelStack::new(),
			user_stack_base: AtomicU64::new(0),
			user_stack_limit: AtomicU64::new(0),
			fs_base: AtomicU64::new(0),

			pending: AtomicU64::new(0),
			sigmask: AtomicU64::new(0),
			gate: Mutex::new(ThreadGate {
				blocker: None,
			}),

			links: QueueLinks::new(),
		})
	}

	/// Returns the thread's ID.
	#[inline]
	pub fn tid(&self) -> Tid {
		self.tid
	}

	/// Returns the owning process.
	///
	/// Returns `None` once the process block has been destroyed by the
	/// reaper.
	pub fn process(&self) -> Option<Arc<Process>> {
		self.process.upgrade()
	}

	/// Tells whether the thread belongs to `process`.
	pub fn belongs_to(&self, process: &Arc<Process>) -> bool {
		ptr::eq(self.process.as_ptr(), Arc::as_ptr(process))
	}

	/// Returns the thread's scheduling priority.
	#[inline]
	pub fn priority(&self) -> u8 {
		self.priority.load(Relaxed)
	}

	/// Sets the thread's scheduling priority.
	#[inline]
	pub fn set_priority(&self, priority: u8) {
		self.priority.store(priority, Relaxed);
	}

	/// Returns the thread's current state.
	#[inline]
	pub fn state(&self) -> ThreadState {
		ThreadState::from_id(self.state.load(SeqCst))
	}

	/// Sets the thread's state.
	#[inline]
	pub fn set_state(&self, state: ThreadState) {
		self.state.store(state as _, SeqCst);
	}

	/// Returns the remaining time slice, in ticks.
	#[inline]
	pub fn time_slice(&self) -> u32 {
		self.time_slice.load(Relaxed)
	}

	/// Sets the remaining time slice.
	#[inline]
	pub fn set_time_slice(&self, ticks: u32) {
		self.time_slice.store(ticks, Relaxed);
	}

	/// Decrements the remaining time slice. Called by the dispatcher only
	/// while the thread is the current thread of its CPU.
	#[inline]
	pub(crate) fn consume_tick(&self) {
		self.time_slice.fetch_sub(1, Relaxed);
	}

	/// Returns the default time slice, in ticks.
	#[inline]
	pub fn default_time_slice(&self) -> u32 {
		self.default_time_slice.load(Relaxed)
	}

	/// Sets the default time slice.
	#[inline]
	pub fn set_default_time_slice(&self, ticks: u32) {
		self.default_time_slice.store(ticks, Relaxed);
	}

	/// Reloads the remaining slice from the default.
	#[inline]
	pub fn reset_time_slice(&self) {
		self.set_time_slice(self.default_time_slice());
	}

	/// Returns the address of the top of the thread's kernel stack.
	#[inline]
	pub fn kernel_stack_top(&self) -> u64 {
		self.kernel_stack.top()
	}

	/// Sets the user stack region: base address and limit.
	pub fn set_user_stack(&self, base: u64, limit: u64) {
		self.user_stack_base.store(base, Relaxed);
		self.user_stack_limit.store(limit, Relaxed);
	}

	/// Returns the user stack region as `(base, limit)`.
	pub fn user_stack(&self) -> (u64, u64) {
		(
			self.user_stack_base.load(Relaxed),
			self.user_stack_limit.load(Relaxed),
		)
	}

	/// Returns the FS segment base.
	#[inline]
	pub fn fs_base(&self) -> u64 {
		self.fs_base.load(Relaxed)
	}

	/// Sets the FS segment base, effective at the next dispatch.
	#[inline]
	pub fn set_fs_base(&self, base: u64) {
		self.fs_base.store(base, Relaxed);
	}

	/// Saves the outgoing thread's context from the interrupt frame.
	pub(crate) fn save_context(&self, frame: &IntFrame) {
		fxsave(&mut self.fx_state.lock());
		*self.regs.lock() = *frame;
	}

	/// Sends the signal `sig` to the thread by setting its pending bit.
	///
	/// The signal is delivered no later than the thread's next transition to
	/// user mode.
	pub fn signal(&self, sig: super::signal::Signal) {
		self.pending.fetch_or(sig.mask_bit(), SeqCst);
	}

	/// Returns the pending bitset.
	#[inline]
	pub fn pending(&self) -> u64 {
		self.pending.load(SeqCst)
	}

	/// Clears the pending bit of `sig`.
	pub(crate) fn clear_pending(&self, sig: super::signal::Signal) {
		self.pending.fetch_and(!sig.mask_bit(), SeqCst);
	}

	/// Returns the signal mask bitset.
	#[inline]
	pub fn sigmask(&self) -> u64 {
		self.sigmask.load(SeqCst)
	}

	/// Replaces the signal mask bitset.
	#[inline]
	pub fn set_sigmask(&self, mask: u64) {
		self.sigmask.store(mask, SeqCst);
	}

	/// Adds the given bits to the signal mask.
	pub(crate) fn raise_sigmask(&self, bits: u64) {
		self.sigmask.fetch_or(bits, SeqCst);
	}

	/// Tells whether the thread has a pending, unmasked signal.
	pub fn has_deliverable_signal(&self) -> bool {
		self.pending() & !self.sigmask() != 0
	}

	/// Suspends the calling thread on `blocker` until it is unblocked or
	/// interrupted.
	///
	/// The calling thread must be `self`.
	pub fn block(self: &Arc<Self>, blocker: Arc<dyn Blocker>) -> BlockOutcome {
		{
			let mut gate = self.gate.lock();
			blocker.attach(self);
			// The condition may have fired between registration and now
			if blocker.ready() {
				return blocker.outcome();
			}
			gate.blocker = Some(blocker.clone());
			self.set_state(ThreadState::Blocked);
			self.set_time_slice(0);
		}
		while self.state() == ThreadState::Blocked {
			scheduler::yield_now();
			crate::arch::x86::hlt();
		}
		self.gate.lock().blocker = None;
		blocker.outcome()
	}

	/// Returns the thread to `Running` if it was `Blocked`.
	pub(crate) fn unblock(&self) {
		let _gate = self.gate.lock();
		if self.state() == ThreadState::Blocked {
			self.set_state(ThreadState::Running);
		}
	}

	/// Sleeps the calling thread for at least `us` microseconds.
	pub fn sleep(us: u64) {
		time::wait_us(us);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::x86::DEFAULT_RFLAGS;

	#[test]
	fn defaults() {
		let thread = Thread::new(
			&Weak::new(),
			1,
			USER_PRIORITY,
			DEFAULT_TIME_SLICE,
			IntFrame::new_kernel(0x1000, 0x2000),
		);
		assert_eq!(thread.state(), ThreadState::Running);
		assert_eq!(thread.time_slice(), DEFAULT_TIME_SLICE);
		assert_eq!(thread.regs.lock().rflags, DEFAULT_RFLAGS);
		assert_eq!(thread.kernel_stack_top() % 8, 0);
		assert!(thread.process().is_none());
	}

	#[test]
	fn slice_reload() {
		let thread = Thread::new(&Weak::new(), 1, USER_PRIORITY, 3, IntFrame::default());
		thread.consume_tick();
		thread.consume_tick();
		assert_eq!(thread.time_slice(), 1);
		thread.reset_time_slice();
		assert_eq!(thread.time_slice(), 3);
	}
}
