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

//! Blocking primitive.
//!
//! A blocker is an abstract suspendable condition. A thread blocks on it
//! through [`Thread::block`](super::Thread::block); whoever satisfies the
//! condition calls [`Blocker::unblock`]; process termination calls
//! [`Blocker::interrupt`] to force a blocked thread out so it can be torn
//! down.
//!
//! Blockers hold non-owning references to the objects they wait on and
//! unregister themselves on destruction.

use crate::{
	process::{pid::Pid, Process, Thread},
	sync::IntSpin,
};
use alloc::{
	sync::{Arc, Weak},
	vec::Vec,
};

/// The result of a [`Thread::block`](super::Thread::block) call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockOutcome {
	/// The condition was satisfied.
	Completed,
	/// The blocker was interrupted; the waiting thread is being torn down.
	Interrupted,
}

/// An abstract suspendable condition.
pub trait Blocker: Send + Sync {
	/// Records the blocked thread. Called under the thread's gate lock when
	/// the thread begins waiting.
	fn attach(&self, thread: &Arc<Thread>);

	/// Marks the condition satisfied and returns the attached thread to
	/// `Running`. `cause` is the process that satisfied the condition.
	///
	/// Unblocking an already-released blocker is a no-op: a blocker fires at
	/// most once.
	fn unblock(&self, cause: &Arc<Process>);

	/// Forces the blocker to release without success, so the blocked thread
	/// promptly returns from its `block` call.
	fn interrupt(&self);

	/// Tells whether the blocker has already fired.
	fn ready(&self) -> bool;

	/// Tells whether the blocker was released by [`interrupt`](Self::interrupt).
	fn interrupted(&self) -> bool;

	/// Returns the outcome of the completed wait.
	fn outcome(&self) -> BlockOutcome {
		if self.interrupted() {
			BlockOutcome::Interrupted
		} else {
			BlockOutcome::Completed
		}
	}
}

struct Inner {
	/// The processes whose death satisfies the condition.
	waiting_on: Vec<Weak<Process>>,
	/// The blocked thread.
	thread: Option<Arc<Thread>>,
	/// Set when the blocker fires; it fires at most once.
	fired: bool,
	interrupted: bool,
	/// The PID of the process that satisfied the condition.
	cause: Option<Pid>,
}

/// A blocker waiting for one or more processes to die.
///
/// The blocker is wired into each target's blocking list by
/// [`wait_on`](Self::wait_on) and unlinked on destruction. When a target
/// process dies, its termination path unblocks every registered blocker.
pub struct ProcessStateBlocker {
	inner: IntSpin<Inner>,
}

impl ProcessStateBlocker {
	/// Creates a blocker with no targets.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			inner: IntSpin::new(Inner {
				waiting_on: Vec::new(),
				thread: None,
				fired: false,
				interrupted: false,
				cause: None,
			}),
		})
	}

	/// Adds `process` to the set of waited-on processes, registering the
	/// blocker in the process's blocking list.
	pub fn wait_on(self: &Arc<Self>, process: &Arc<Process>) {
		self.inner.lock().waiting_on.push(Arc::downgrade(process));
		let strong: Arc<dyn Blocker> = self.clone();
		let weak: Weak<dyn Blocker> = Arc::downgrade(&strong);
		process.register_blocker(weak);
	}

	/// Returns the PID of the process whose death fired the blocker, if any.
	pub fn cause(&self) -> Option<Pid> {
		self.inner.lock().cause
	}
}

impl Blocker for ProcessStateBlocker {
	fn attach(&self, thread: &Arc<Thread>) {
		self.inner.lock().thread = Some(thread.clone());
	}

	fn unblock(&self, cause: &Arc<Process>) {
		let thread = {
			let mut inner = self.inner.lock();
			if inner.fired {
				return;
			}
			inner.fired = true;
			inner.cause = Some(cause.pid());
			inner
				.waiting_on
				.retain(|w| !core::ptr::eq(w.as_ptr(), Arc::as_ptr(cause)));
			inner.thread.take()
		};
		if let Some(thread) = thread {
			thread.unblock();
		}
	}

	fn interrupt(&self) {
		let thread = {
			let mut inner = self.inner.lock();
			if inner.fired {
				return;
			}
			inner.fired = true;
			inner.interrupted = true;
			inner.thread.take()
		};
		if let Some(thread) = thread {
			thread.unblock();
		}
	}

	fn ready(&self) -> bool {
		self.inner.lock().fired
	}

	fn interrupted(&self) -> bool {
		self.inner.lock().interrupted
	}
}

impl Drop for ProcessStateBlocker {
	fn drop(&mut self) {
		let waiting_on = core::mem::take(&mut self.inner.lock().waiting_on);
		let this = self as *const Self as *const ();
		for target in waiting_on {
			if let Some(process) = target.upgrade() {
				process.unregister_blocker(this);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::process::Process;

	#[test]
	fn unblock_fires_once() {
		let _guard = crate::process::tests::world_lock();
		let process = Process::initialize_empty();
		let blocker = ProcessStateBlocker::new();
		blocker.wait_on(&process);
		assert!(!blocker.ready());
		blocker.unblock(&process);
		assert!(blocker.ready());
		assert_eq!(blocker.cause(), Some(process.pid()));
		assert_eq!(blocker.outcome(), BlockOutcome::Completed);
		// A second unblock is a no-op
		blocker.unblock(&process);
		assert_eq!(blocker.cause(), Some(process.pid()));
	}

	#[test]
	fn interrupt_reports_interrupted() {
		let _guard = crate::process::tests::world_lock();
		let process = Process::initialize_empty();
		let blocker = ProcessStateBlocker::new();
		blocker.wait_on(&process);
		blocker.interrupt();
		assert!(blocker.ready());
		assert!(blocker.interrupted());
		assert_eq!(blocker.outcome(), BlockOutcome::Interrupted);
		// Interrupt wins over a later unblock
		blocker.unblock(&process);
		assert_eq!(blocker.outcome(), BlockOutcome::Interrupted);
	}

	#[test]
	fn drop_unregisters() {
		let _guard = crate::process::tests::world_lock();
		let process = Process::initialize_empty();
		{
			let blocker = ProcessStateBlocker::new();
			blocker.wait_on(&process);
			assert_eq!(process.blocker_count(), 1);
		}
		assert_eq!(process.blocker_count(), 0);
	}

	#[test]
	fn block_suspends_until_unblocked() {
		use crate::process::ThreadState;

		let _guard = crate::process::tests::world_lock();
		crate::process::scheduler::tests::fresh_cpus();
		let process = Process::initialize_empty();
		let thread = process.main_thread();
		let blocker = ProcessStateBlocker::new();
		blocker.wait_on(&process);
		let waiter = std::thread::spawn({
			let thread = thread.clone();
			let blocker: Arc<dyn Blocker> = blocker.clone();
			move || thread.block(blocker)
		});
		// The blocker has not fired: the thread suspends with a zero slice
		crate::process::tests::wait_until(|| thread.state() == ThreadState::Blocked);
		assert_eq!(thread.time_slice(), 0);
		blocker.unblock(&process);
		let outcome = waiter.join().unwrap();
		assert_eq!(outcome, BlockOutcome::Completed);
		assert_eq!(thread.state(), ThreadState::Running);
		assert_eq!(blocker.cause(), Some(process.pid()));
		// The blocker hook is cleared once the wait completes
		assert!(thread.gate.lock().blocker.is_none());
	}

	#[test]
	fn block_released_by_interrupt() {
		use crate::process::ThreadState;

		let _guard = crate::process::tests::world_lock();
		crate::process::scheduler::tests::fresh_cpus();
		let process = Process::initialize_empty();
		let thread = process.main_thread();
		let blocker = ProcessStateBlocker::new();
		blocker.wait_on(&process);
		let waiter = std::thread::spawn({
			let thread = thread.clone();
			let blocker: Arc<dyn Blocker> = blocker.clone();
			move || thread.block(blocker)
		});
		crate::process::tests::wait_until(|| thread.state() == ThreadState::Blocked);
		blocker.interrupt();
		let outcome = waiter.join().unwrap();
		assert_eq!(outcome, BlockOutcome::Interrupted);
		assert_eq!(thread.state(), ThreadState::Running);
	}
}
