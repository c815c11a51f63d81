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

//! The reaper: a background kernel thread finalizing destroyed processes.
//!
//! Termination leaves the process block on the destroyed list; once its
//! lifecycle lock can be write-acquired (meaning the owning CPU is done with
//! it), the reaper destroys the address space and drops its reference. A
//! parent still referencing the dead child keeps the block alive until it
//! harvests the death.
//!
//! The reaper also performs the terminations that cannot run in the context
//! that decided them, such as a signal's default action.

use crate::{
	process,
	process::{Process, Thread},
	sync::IntSpin,
};
use alloc::{sync::Arc, vec::Vec};
use core::mem;

/// The interval between two reaper passes, in microseconds.
const REAP_INTERVAL_US: u64 = 100_000;

lazy_static::lazy_static! {
	/// Terminated processes waiting to be finalized.
	static ref DESTROYED: IntSpin<Vec<Arc<Process>>> = IntSpin::new(Vec::new());
	/// Processes whose termination was requested from a context that cannot
	/// perform it, such as signal delivery inside the dispatcher.
	static ref KILL_QUEUE: IntSpin<Vec<Arc<Process>>> = IntSpin::new(Vec::new());
}

/// Appends a terminated process to the destroyed list. Called by
/// [`process::end`] with the process's lifecycle lock write-held.
pub(crate) fn push_destroyed(process: Arc<Process>) {
	DESTROYED.lock().push(process);
}

/// Requests the termination of `process` from the reaper's context.
pub(crate) fn queue_kill(process: Arc<Process>) {
	KILL_QUEUE.lock().push(process);
}

/// Performs one reaper pass.
pub fn reap_once() {
	// Deferred terminations first, so their blocks reach the destroyed list
	let kills = mem::take(&mut *KILL_QUEUE.lock());
	for proc in kills {
		if !proc.is_dying() && !proc.is_dead() {
			process::end(&proc);
		}
	}
	DESTROYED.lock().retain(|proc| {
		// A held lifecycle lock means the owning CPU has not finished with
		// the process yet; retry on the next pass
		let Some(_lifecycle) = proc.lifecycle.try_write() else {
			return true;
		};
		// Destroy the address space regardless of remaining linkage; the
		// dead block stays observable to a parent that still references it
		proc.address_space().take();
		false
	});
}

/// The reaper thread body.
pub fn reaper_main() -> ! {
	loop {
		reap_once();
		Thread::sleep(REAP_INTERVAL_US);
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	/// Runs reaper passes until both queues are empty.
	pub fn drain_destroyed() {
		loop {
			reap_once();
			if DESTROYED.lock().is_empty() && KILL_QUEUE.lock().is_empty() {
				break;
			}
		}
	}

	/// Returns the number of processes awaiting finalization.
	pub fn destroyed_len() -> usize {
		DESTROYED.lock().len()
	}

	#[test]
	fn reaper_destroys_address_space_and_releases_block() {
		let _guard = crate::process::tests::world_lock();
		crate::process::scheduler::tests::fresh_cpus();
		let parent = Process::initialize_empty();
		process::push_global(&parent);
		let child = Process::clone_from(&parent);
		assert!(child.address_space().is_some());
		process::end(&child);
		assert!(destroyed_len() >= 1);
		reap_once();
		// The address space is gone even though the parent still links the
		// dead child
		assert!(child.address_space().is_none());
		assert!(parent.children().iter().any(|c| Arc::ptr_eq(c, &child)));
		assert_eq!(destroyed_len(), 0);
		crate::process::tests::remove_global(&parent);
	}

	#[test]
	fn kill_queue_terminates_from_reaper_context() {
		let _guard = crate::process::tests::world_lock();
		crate::process::scheduler::tests::fresh_cpus();
		let proc = Process::initialize_empty();
		process::push_global(&proc);
		queue_kill(proc.clone());
		reap_once();
		assert!(proc.is_dead());
		assert!(process::by_pid(proc.pid()).is_none());
		drain_destroyed();
	}
}
