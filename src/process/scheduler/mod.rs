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

//! The scheduler: per-CPU run queues, time slicing and dispatch.
//!
//! The timer interrupt calls [`tick`], which broadcasts the schedule IPI to
//! the other cores and dispatches on its own. Each core selects the next
//! thread from its own run queue: threads are placed once, on the CPU with
//! the shortest queue, and never migrate afterwards.

pub mod queue;
pub(crate) mod switch;

use crate::{
	arch::x86::{
		apic,
		apic::IpiDest,
		hlt,
		idt::{IntFrame, SCHEDULE_VECTOR},
		smp, sti,
		tss::Tss,
	},
	process::{
		thread::{ThreadState, IDLE_PRIORITY},
		Process, Thread,
	},
	sync::{AtomicArc, IntSpin},
	time,
};
use alloc::{sync::Arc, vec::Vec};
use core::{
	cell::UnsafeCell,
	sync::atomic::{
		AtomicBool, AtomicUsize,
		Ordering::{Acquire, Release},
	},
};
use queue::RunQueue;
use spin::Once;

/// Per-CPU scheduling state.
pub struct PerCpu {
	/// The core's index.
	pub id: usize,
	/// The core's local APIC ID.
	pub apic_id: u8,

	/// The core's run queue.
	pub(crate) run_queue: IntSpin<RunQueue>,
	/// Mirror of the queue's length, readable without the lock for
	/// shortest-queue placement.
	queue_len: AtomicUsize,
	/// The core's current thread.
	///
	/// Stored only with the core's run-queue lock held; the termination
	/// rendezvous relies on this to read it safely from other cores.
	pub(crate) current: AtomicArc<Thread>,

	/// The process owning the core's idle thread.
	idle_process: Arc<Process>,
	/// The core's idle thread. Dispatched when the queue has no runnable
	/// thread; never a queue member.
	pub(crate) idle_thread: Arc<Thread>,

	/// The core's TSS.
	tss: UnsafeCell<Tss>,
}

// Safety: `tss` is only accessed by the owning core, from the dispatch path
// with interrupts disabled.
unsafe impl Sync for PerCpu {}

impl PerCpu {
	/// Returns a mutable reference to the core's TSS.
	///
	/// # Safety
	///
	/// Only the owning core may call this, with interrupts disabled.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn tss(&self) -> &mut Tss {
		&mut *self.tss.get()
	}

	/// Returns the cached queue length.
	#[inline]
	fn queue_len(&self) -> usize {
		self.queue_len.load(Acquire)
	}

	/// Refreshes the cached queue length after a mutation.
	#[inline]
	pub(crate) fn update_queue_len(&self, len: usize) {
		self.queue_len.store(len, Release);
	}
}

/// The per-CPU structures, one per core.
static CPUS: Once<Vec<PerCpu>> = Once::new();
/// Set once the scheduler is ready to dispatch; ticks are ignored before.
static READY: AtomicBool = AtomicBool::new(false);

/// Creates the per-CPU scheduler state for `cpu_count` cores.
///
/// Must be called on the boot CPU before any other CPU is released.
pub fn setup(cpu_count: usize) {
	CPUS.call_once(|| {
		(0..cpu_count)
			.map(|id| {
				let idle_process = Process::initialize_empty();
				idle_process.set_name("idle");
				let idle_thread = idle_process.main_thread();
				idle_thread.set_priority(IDLE_PRIORITY);
				// A zero slice makes the idle thread yield on every tick
				idle_thread.set_default_time_slice(0);
				idle_thread.set_time_slice(0);
				*idle_thread.regs.lock() =
					IntFrame::new_kernel(idle_main as usize as u64, idle_thread.kernel_stack_top());
				PerCpu {
					id,
					apic_id: id as u8,
					run_queue: IntSpin::new(RunQueue::new()),
					queue_len: AtomicUsize::new(0),
					current: AtomicArc::empty(),
					idle_process,
					idle_thread,
					tss: UnsafeCell::new(Tss::new()),
				}
			})
			.collect()
	});
}

/// The idle thread body.
fn idle_main() -> ! {
	loop {
		sti();
		hlt();
	}
}

/// Marks the scheduler ready and becomes the boot CPU's idle-busy loop.
///
/// Never returns: the first tick dispatches away from this context for good.
pub fn start() -> ! {
	READY.store(true, Release);
	sti();
	loop {
		hlt();
	}
}

/// Tells whether the scheduler is dispatching.
#[inline]
pub fn is_ready() -> bool {
	READY.load(Acquire)
}

/// Returns the per-CPU structures.
pub(crate) fn cpus() -> &'static [PerCpu] {
	CPUS.get().expect("scheduler used before setup")
}

/// Returns the per-CPU structure of the current core.
pub(crate) fn local() -> &'static PerCpu {
	&cpus()[smp::core_id()]
}

/// Returns the current thread of the current core.
pub fn current_thread() -> Option<Arc<Thread>> {
	CPUS.get()?;
	local().current.get()
}

/// Places a new thread on the CPU with the shortest run queue.
///
/// The first empty queue encountered short-circuits the search. There is no
/// migration afterwards: the thread stays on this CPU for its lifetime.
pub fn enqueue_new(thread: Arc<Thread>) {
	let cpus = cpus();
	let mut target = &cpus[0];
	for cpu in &cpus[1..] {
		if cpu.queue_len() < target.queue_len() {
			target = cpu;
		}
		if target.queue_len() == 0 {
			break;
		}
	}
	let mut queue = target.run_queue.lock_remote();
	queue.push_back(thread);
	target.update_queue_len(queue.len());
}

/// Requests a reschedule of the current core: the current thread gives up the
/// rest of its slice and the schedule interrupt is raised.
pub fn yield_now() {
	if let Some(cur) = current_thread() {
		cur.set_time_slice(0);
	}
	apic::raise_schedule_ipi();
}

/// The timer interrupt entry point.
///
/// Broadcasts the schedule IPI to the other cores and dispatches on this one.
pub fn tick(frame: &mut IntFrame) {
	if !is_ready() {
		return;
	}
	time::on_tick();
	apic::send_ipi(IpiDest::Others, SCHEDULE_VECTOR);
	schedule(frame);
}

/// The dispatcher: selects the next thread of the current core and context
/// switches to it.
///
/// Called from the timer tick and from the schedule IPI, with `frame` being
/// the interrupt frame the interrupted context will be resumed from.
pub fn schedule(frame: &mut IntFrame) {
	let cpu = local();
	// Credit the current thread; while its slice lasts, no switch happens
	if let Some(cur) = cpu.current.get() {
		if let Some(proc) = cur.process() {
			proc.add_active_tick();
		}
		if cur.time_slice() > 0 {
			cur.consume_tick();
			return;
		}
	}
	// Failing to take the lock drops this tick entirely; this is intentional,
	// to avoid convoys on the queue lock. The next tick retries.
	let Some(mut queue) = cpu.run_queue.try_lock() else {
		return;
	};
	let cur = cpu.current.get();
	let next = match cur {
		None => cpu.idle_thread.clone(),
		Some(_) if queue.is_empty() => cpu.idle_thread.clone(),
		Some(cur) => {
			let mut next = if cur.state() == ThreadState::Dying {
				// The reaper will free it once the process block goes
				queue.remove(&cur);
				cpu.update_queue_len(queue.len());
				cpu.idle_thread.clone()
			} else if !Arc::ptr_eq(&cur, &cpu.idle_thread) {
				cur.reset_time_slice();
				cur.save_context(frame);
				queue.next_arc(&cur)
			} else {
				queue.front_arc().unwrap()
			};
			// Skip blocked threads; if the whole ring is blocked, idle
			if next.state() == ThreadState::Blocked {
				let first = next.clone();
				loop {
					next = queue.next_arc(&next);
					if next.state() != ThreadState::Blocked || Arc::ptr_eq(&next, &first) {
						break;
					}
				}
				if next.state() == ThreadState::Blocked {
					next = cpu.idle_thread.clone();
				}
			}
			next
		}
	};
	cpu.current.swap(Some(next.clone()));
	drop(queue);
	switch::restore(cpu, &next, frame);
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::{
		arch::x86::{USER_CS, USER_SS},
		process,
		process::thread::DEFAULT_TIME_SLICE,
	};

	/// Initializes two test CPUs and empties their state.
	pub fn fresh_cpus() -> &'static [PerCpu] {
		setup(2);
		let cpus = cpus();
		for cpu in cpus {
			let mut queue = cpu.run_queue.lock();
			while let Some(front) = queue.front_arc() {
				queue.remove(&front);
			}
			cpu.update_queue_len(0);
			cpu.current.swap(None);
		}
		cpus
	}

	fn spawn_user_thread(proc: &Arc<Process>) -> Arc<Thread> {
		let thread = proc.main_thread();
		*thread.regs.lock() =
			IntFrame::new_with_segments(0x40_0000, 0x7000_0000, USER_CS, USER_SS);
		thread
	}

	#[test]
	fn idle_when_no_current_thread() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let mut frame = IntFrame::default();
		schedule(&mut frame);
		let cur = cpus[0].current.get().unwrap();
		assert!(Arc::ptr_eq(&cur, &cpus[0].idle_thread));
	}

	#[test]
	fn dispatches_runnable_thread_and_restores_frame() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc = Process::initialize_empty();
		let thread = spawn_user_thread(&proc);
		thread.set_default_time_slice(DEFAULT_TIME_SLICE);
		thread.set_time_slice(0);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(thread.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		// First pass: no current thread yet, the idle thread is selected
		schedule(&mut frame);
		// Idle has a zero slice: the next tick selects the queue's front
		schedule(&mut frame);
		let cur = cpus[0].current.get().unwrap();
		assert!(Arc::ptr_eq(&cur, &thread));
		assert_eq!(frame.rip, 0x40_0000);
		assert_eq!(frame.cs, USER_CS);
	}

	#[test]
	fn blocked_threads_are_never_dispatched() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc_a = Process::initialize_empty();
		let a = spawn_user_thread(&proc_a);
		a.set_state(ThreadState::Blocked);
		let proc_b = Process::initialize_empty();
		let b = spawn_user_thread(&proc_b);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(a.clone());
			queue.push_back(b.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		schedule(&mut frame);
		schedule(&mut frame);
		// The ring's front is blocked: the walk lands on `b`
		let cur = cpus[0].current.get().unwrap();
		assert!(Arc::ptr_eq(&cur, &b));
		assert_eq!(cur.state(), ThreadState::Running);
	}

	#[test]
	fn all_blocked_falls_back_to_idle() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc = Process::initialize_empty();
		let thread = spawn_user_thread(&proc);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(thread.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		schedule(&mut frame);
		schedule(&mut frame);
		assert!(Arc::ptr_eq(&cpus[0].current.get().unwrap(), &thread));
		// Block it, exhaust its slice: next schedule falls through to idle
		thread.set_state(ThreadState::Blocked);
		thread.set_time_slice(0);
		schedule(&mut frame);
		let cur = cpus[0].current.get().unwrap();
		assert!(Arc::ptr_eq(&cur, &cpus[0].idle_thread));
	}

	#[test]
	fn time_slice_counts_down_between_dispatches() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc = Process::initialize_empty();
		let thread = spawn_user_thread(&proc);
		thread.set_default_time_slice(3);
		thread.set_time_slice(0);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(thread.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		schedule(&mut frame);
		schedule(&mut frame);
		assert!(Arc::ptr_eq(&cpus[0].current.get().unwrap(), &thread));
		// The dispatch reloaded the default slice on the next save; ticks
		// while current consume it one by one without switching
		let before = proc.active_ticks();
		schedule(&mut frame);
		schedule(&mut frame);
		schedule(&mut frame);
		assert!(Arc::ptr_eq(&cpus[0].current.get().unwrap(), &thread));
		assert_eq!(proc.active_ticks(), before + 3);
	}

	#[test]
	fn dying_thread_is_removed_and_idle_selected() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc = Process::initialize_empty();
		let thread = spawn_user_thread(&proc);
		thread.set_time_slice(0);
		{
			let mut queue = cpus[0].run_queue.lock();
			queue.push_back(thread.clone());
			cpus[0].update_queue_len(queue.len());
		}
		let mut frame = IntFrame::default();
		schedule(&mut frame);
		schedule(&mut frame);
		thread.set_state(ThreadState::Dying);
		thread.set_time_slice(0);
		schedule(&mut frame);
		let cur = cpus[0].current.get().unwrap();
		assert!(Arc::ptr_eq(&cur, &cpus[0].idle_thread));
		assert!(!cpus[0].run_queue.lock().contains(&thread));
	}

	#[test]
	fn shortest_queue_placement() {
		let _guard = process::tests::world_lock();
		let cpus = fresh_cpus();
		let proc_a = Process::initialize_empty();
		let proc_b = Process::initialize_empty();
		enqueue_new(proc_a.main_thread());
		enqueue_new(proc_b.main_thread());
		// Two CPU-bound threads on a two-CPU system land on distinct queues
		assert_eq!(cpus[0].run_queue.lock().len(), 1);
		assert_eq!(cpus[1].run_queue.lock().len(), 1);
	}
}
