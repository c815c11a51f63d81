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

//! A process is a task running on the kernel.
//!
//! A process is either live, dying (terminating but still holding resources)
//! or dead (kept only so its parent can observe it; the reaper destroys it
//! later). A process owns its threads: once it is dead, its threads are no
//! longer schedulable.

pub mod blocker;
pub mod exec;
pub mod handle;
pub mod pid;
pub mod reaper;
pub mod scheduler;
pub mod signal;
pub mod thread;

pub use thread::{Thread, ThreadState, Tid};

use crate::{
	arch::x86::{
		apic,
		apic::IpiDest,
		cli,
		idt::{IntFrame, SCHEDULE_VECTOR},
		sti,
	},
	file::FileDescriptor,
	memory,
	memory::AddressSpace,
	sync::{IntSpin, IntSpinGuard},
	time,
};
use alloc::{
	string::{String, ToString},
	sync::{Arc, Weak},
	vec,
	vec::Vec,
};
use blocker::Blocker;
use core::{
	mem, ptr,
	sync::atomic::{
		AtomicBool, AtomicU32, AtomicU64,
		Ordering::{Relaxed, SeqCst},
	},
};
use handle::HandleTable;
use pid::Pid;
use signal::{SigDisposition, Signal, SIGNAL_MAX};
use spin::{Mutex, RwLock};
use thread::{DEFAULT_TIME_SLICE, USER_PRIORITY};

lazy_static::lazy_static! {
	/// The global process list.
	static ref PROCESSES: IntSpin<Vec<Arc<Process>>> = IntSpin::new(Vec::new());
}

/// The **Process Control Block** (PCB).
pub struct Process {
	/// The process's ID.
	pid: Pid,
	/// Human-readable name.
	name: Mutex<String>,
	/// Current working directory.
	working_dir: Mutex<String>,
	/// Owning user.
	uid: AtomicU32,
	/// Effective user.
	euid: AtomicU32,
	/// Owning group.
	gid: AtomicU32,
	/// Uptime ticks at creation.
	created_at: u64,

	/// The process's address space, destroyed by the reaper.
	address_space: IntSpin<Option<AddressSpace>>,
	/// The parent process. Never owning.
	parent: Mutex<Weak<Process>>,
	/// Children, in creation order. A relation, not an ownership: the
	/// children's memory is owned by the global list and the reaper.
	children: Mutex<Vec<Arc<Process>>>,
	/// The process's threads. Owned: thread 1 is the main thread.
	threads: Mutex<Vec<Arc<Thread>>>,
	/// The next thread ID to assign.
	next_tid: AtomicU64,

	/// Open file descriptors, indexed by small integers. Vacant entries keep
	/// the indices of later descriptors stable.
	fds: IntSpin<Vec<Option<Arc<FileDescriptor>>>>,
	/// The process's handle table.
	pub handles: HandleTable,

	/// One disposition per signal number.
	signal_dispositions: IntSpin<[SigDisposition; SIGNAL_MAX]>,
	/// The user-space base of the signal trampoline region.
	signal_trampoline: AtomicU64,

	/// Scheduler ticks consumed by the process's threads.
	active_ticks: AtomicU64,
	/// The process is terminating but still holds resources.
	dying: AtomicBool,
	/// Termination finished; the block remains for wait-style queries.
	dead: AtomicBool,
	/// The lifecycle lock, write-held only by termination and the reaper.
	pub lifecycle: RwLock<()>,
	/// Blockers waiting on this process's death.
	blocking: IntSpin<Vec<Weak<dyn Blocker>>>,
}

impl Process {
	/// Creates a process with a fresh PID and one not-yet-runnable thread.
	///
	/// Dispositions are defaulted, descriptor and handle tables empty, the
	/// working directory is `/` and the name `unknown`. The process has no
	/// address space yet and is not on the global list.
	pub fn initialize_empty() -> Arc<Self> {
		Arc::new_cyclic(|weak| {
			let main = Thread::new(weak, 1, 1, 1, IntFrame::new_kernel(0, 0));
			Self {
				pid: pid::allocate(),
				name: Mutex::new("unknown".to_string()),
				working_dir: Mutex::new("/".to_string()),
				uid: AtomicU32::new(0),
				euid: AtomicU32::new(0),
				gid: AtomicU32::new(0),
				created_at: time::uptime_ticks(),

				address_space: IntSpin::new(None),
				parent: Mutex::new(Weak::new()),
				children: Mutex::new(Vec::new()),
				threads: Mutex::new(vec![main]),
				next_tid: AtomicU64::new(2),

				fds: IntSpin::new(Vec::new()),
				handles: HandleTable::new(),

				signal_dispositions: IntSpin::new([SigDisposition::default(); SIGNAL_MAX]),
				signal_trampoline: AtomicU64::new(0),

				active_ticks: AtomicU64::new(0),
				dying: AtomicBool::new(false),
				dead: AtomicBool::new(false),
				lifecycle: RwLock::new(()),
				blocking: IntSpin::new(Vec::new()),
			}
		})
	}

	/// Creates a kernel-mode process running `entry` and places its thread on
	/// the shortest run queue.
	pub fn create_kernel(entry: fn() -> !) -> Arc<Self> {
		let proc = Self::initialize_empty();
		*proc.address_space.lock() = Some(AddressSpace::new());
		let main = proc.main_thread();
		*main.regs.lock() =
			IntFrame::new_kernel(entry as usize as u64, main.kernel_stack_top());
		push_global(&proc);
		scheduler::enqueue_new(main);
		proc
	}

	/// Clones the process: forked address space, inherited name, working
	/// directory and user IDs, parent pointer set.
	///
	/// The new process is returned unrun; [`start`] makes it runnable.
	pub fn clone_from(parent: &Arc<Self>) -> Arc<Self> {
		let proc = Self::initialize_empty();
		*proc.address_space.lock() = parent.address_space().as_ref().map(AddressSpace::fork);
		proc.set_name(&parent.name());
		proc.set_working_dir(&parent.working_dir());
		proc.uid.store(parent.uid.load(Relaxed), Relaxed);
		proc.euid.store(parent.euid.load(Relaxed), Relaxed);
		proc.gid.store(parent.gid.load(Relaxed), Relaxed);
		*proc.parent.lock() = Arc::downgrade(parent);
		parent.children.lock().push(proc.clone());
		push_global(&proc);
		proc
	}

	/// Adds a thread to the process with the given entry point, user stack
	/// pointer and segment selectors, and enqueues it on the shortest run
	/// queue. Returns the new thread's ID.
	pub fn create_child_thread(self: &Arc<Self>, entry: u64, stack: u64, cs: u64, ss: u64) -> Tid {
		let tid = self.next_tid.fetch_add(1, Relaxed);
		let thread = Thread::new(
			&Arc::downgrade(self),
			tid,
			USER_PRIORITY,
			DEFAULT_TIME_SLICE,
			IntFrame::new_with_segments(entry, stack, cs, ss),
		);
		thread.set_user_stack(stack, stack);
		self.threads.lock().push(thread.clone());
		scheduler::enqueue_new(thread);
		tid
	}

	/// Returns the process's ID.
	#[inline]
	pub fn pid(&self) -> Pid {
		self.pid
	}

	/// Returns the process's name.
	pub fn name(&self) -> String {
		self.name.lock().clone()
	}

	/// Sets the process's name.
	pub fn set_name(&self, name: &str) {
		*self.name.lock() = name.to_string();
	}

	/// Returns the process's working directory.
	pub fn working_dir(&self) -> String {
		self.working_dir.lock().clone()
	}

	/// Sets the process's working directory.
	pub fn set_working_dir(&self, path: &str) {
		*self.working_dir.lock() = path.to_string();
	}

	/// Returns the uptime ticks at which the process was created.
	#[inline]
	pub fn created_at(&self) -> u64 {
		self.created_at
	}

	/// Returns the process's address space.
	pub fn address_space(&self) -> IntSpinGuard<'_, Option<AddressSpace>> {
		self.address_space.lock()
	}

	/// Returns the parent process, if still referenced.
	pub fn parent(&self) -> Option<Arc<Process>> {
		self.parent.lock().upgrade()
	}

	/// Returns the process's children.
	pub fn children(&self) -> Vec<Arc<Process>> {
		self.children.lock().clone()
	}

	/// Returns the thread with the given ID.
	pub fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
		self.threads.lock().iter().find(|t| t.tid() == tid).cloned()
	}

	/// Returns the main thread (thread 1).
	pub fn main_thread(&self) -> Arc<Thread> {
		self.thread(1).unwrap()
	}

	/// Returns every thread of the process.
	pub fn threads(&self) -> Vec<Arc<Thread>> {
		self.threads.lock().clone()
	}

	/// Appends `fd` to the descriptor table, returning its index.
	pub fn push_fd(&self, fd: Option<Arc<FileDescriptor>>) -> usize {
		let mut fds = self.fds.lock();
		fds.push(fd);
		fds.len() - 1
	}

	/// Returns the descriptor at `index`.
	pub fn fd(&self, index: usize) -> Option<Arc<FileDescriptor>> {
		self.fds.lock().get(index).cloned().flatten()
	}

	/// Returns the disposition for `sig`.
	pub fn signal_disposition(&self, sig: Signal) -> SigDisposition {
		self.signal_dispositions.lock()[sig.id() as usize]
	}

	/// Replaces the disposition for `sig`. Used by the system-call layer.
	pub fn set_signal_disposition(&self, sig: Signal, disposition: SigDisposition) {
		self.signal_dispositions.lock()[sig.id() as usize] = disposition;
	}

	/// Returns the user-space base of the signal trampoline.
	#[inline]
	pub fn signal_trampoline(&self) -> u64 {
		self.signal_trampoline.load(Relaxed)
	}

	/// Records the user-space base of the signal trampoline.
	pub(crate) fn set_signal_trampoline(&self, base: u64) {
		self.signal_trampoline.store(base, Relaxed);
	}

	/// Sends `sig` to the process by delivering it to thread 1.
	pub fn signal(&self, sig: Signal) {
		self.main_thread().signal(sig);
	}

	/// Credits the process with one scheduler tick.
	#[inline]
	pub(crate) fn add_active_tick(&self) {
		self.active_ticks.fetch_add(1, Relaxed);
	}

	/// Returns the number of scheduler ticks consumed by the process.
	pub fn active_ticks(&self) -> u64 {
		self.active_ticks.load(Relaxed)
	}

	/// Tells whether the process is terminating.
	#[inline]
	pub fn is_dying(&self) -> bool {
		self.dying.load(SeqCst)
	}

	/// Tells whether the process is dead.
	#[inline]
	pub fn is_dead(&self) -> bool {
		self.dead.load(SeqCst)
	}

	/// Registers a blocker waiting on this process's death.
	pub(crate) fn register_blocker(&self, blocker: Weak<dyn Blocker>) {
		self.blocking.lock().push(blocker);
	}

	/// Unregisters the blocker at address `blocker`.
	pub(crate) fn unregister_blocker(&self, blocker: *const ()) {
		self.blocking
			.lock()
			.retain(|w| w.as_ptr() as *const () != blocker);
	}

	#[cfg(test)]
	pub(crate) fn blocker_count(&self) -> usize {
		self.blocking.lock().len()
	}
}

/// Appends `process` to the global process list.
pub(crate) fn push_global(process: &Arc<Process>) {
	PROCESSES.lock().push(process.clone());
}

/// Returns the live process with the given PID.
pub fn by_pid(pid: Pid) -> Option<Arc<Process>> {
	PROCESSES.lock().iter().find(|p| p.pid() == pid).cloned()
}

/// Returns the least live PID strictly greater than `pid`, or zero if none
/// exists.
pub fn next_pid_after(pid: Pid) -> Pid {
	PROCESSES
		.lock()
		.iter()
		.map(|p| p.pid())
		.filter(|p| *p > pid)
		.min()
		.unwrap_or(0)
}

/// Returns the process owning the current thread.
pub fn current() -> Option<Arc<Process>> {
	scheduler::current_thread()?.process()
}

/// Makes `process` runnable by placing its main thread on the shortest run
/// queue. Decoupled from creation: a process exists before it runs.
pub fn start(process: &Arc<Process>) {
	scheduler::enqueue_new(process.main_thread());
}

/// Terminates `process`: the cross-CPU rendezvous.
///
/// On return to a caller not belonging to `process`, no CPU is executing any
/// of the process's threads (the reaper may not yet have freed them). A
/// caller belonging to `process` never returns.
pub fn end(process: &Arc<Process>) {
	log::debug!("ending process: {} ({})", process.name(), process.pid());
	assert!(!process.is_dead());
	assert!(!process.is_dying());
	process.dying.store(true, SeqCst);
	// End live children; dead ones only need unlinking
	loop {
		let child = process.children.lock().first().cloned();
		let Some(child) = child else {
			break;
		};
		if !child.is_dead() {
			end(&child);
		}
		process.children.lock().retain(|c| !Arc::ptr_eq(c, &child));
	}
	let cpu = scheduler::local();
	let current = cpu.current.get();
	let current_ptr = current.as_ref().map(Arc::as_ptr).unwrap_or(ptr::null());
	// Quiesce every non-current thread. Acquiring a thread's gate proves no
	// other CPU is inside its blocker or signal critical section; once it is
	// `Blocked` with a zero slice, it will never be dispatched again.
	let threads = process.threads();
	let mut retry: Vec<Arc<Thread>> = Vec::new();
	for thread in threads.iter().filter(|t| !ptr::eq(Arc::as_ptr(t), current_ptr)) {
		if thread.state() == ThreadState::Blocked {
			let blocker = thread.gate.lock().blocker.clone();
			if let Some(blocker) = blocker {
				blocker.interrupt();
			}
		}
		thread.set_state(ThreadState::Zombie);
		match thread.gate.try_lock() {
			Some(_gate) => {
				thread.set_state(ThreadState::Blocked);
				thread.set_time_slice(0);
				thread.set_default_time_slice(0);
			}
			None => retry.push(thread.clone()),
		}
	}
	while !retry.is_empty() {
		retry.retain(|thread| match thread.gate.try_lock() {
			Some(_gate) => {
				thread.set_state(ThreadState::Blocked);
				thread.set_time_slice(0);
				thread.set_default_time_slice(0);
				false
			}
			None => true,
		});
		if retry.is_empty() {
			break;
		}
		// Do not chew through CPU time if a remote section is slow
		Thread::sleep(50_000);
	}
	// Purge the local run queue
	{
		let mut queue = cpu.run_queue.lock();
		queue.remove_matching(|t| {
			t.belongs_to(process) && !ptr::eq(t as *const Thread, current_ptr)
		});
		cpu.update_queue_len(queue.len());
	}
	// Rendezvous with every other CPU: wait for it to vacate our threads,
	// then purge its queue
	for other in scheduler::cpus() {
		if other.id == cpu.id {
			continue;
		}
		let mut queue = loop {
			let queue = other.run_queue.lock_remote();
			let running_ours = other
				.current
				.get()
				.map(|c| c.belongs_to(process))
				.unwrap_or(false);
			if !running_ours {
				break queue;
			}
			// That thread is Blocked with a zero slice: the next tick on the
			// remote core switches it out. Release the lock so that tick can
			// take it.
			drop(queue);
			core::hint::spin_loop();
		};
		queue.remove_matching(|t| t.belongs_to(process));
		other.update_queue_len(queue.len());
		let remote_idle = other.current.get().is_none();
		drop(queue);
		if remote_idle {
			apic::send_ipi(IpiDest::Target(other.apic_id), SCHEDULE_VECTOR);
		}
	}
	// Close descriptors and destroy handle-table objects
	process.fds.lock().clear();
	process.handles.destroy_all();
	process.dead.store(true, SeqCst);
	PROCESSES.lock().retain(|p| !Arc::ptr_eq(p, process));
	// Wake everyone waiting on the process
	let blocking = mem::take(&mut *process.blocking.lock());
	for blocker in blocking {
		if let Some(blocker) = blocker.upgrade() {
			blocker.unblock(process);
		}
	}
	// The parent keeps the dead child on its list: wait-style queries may
	// still want to confirm the death
	if let Some(parent) = process.parent() {
		if !parent.is_dying() {
			parent.signal(Signal::SIGCHLD);
		}
	}
	let lifecycle = process.lifecycle.write();
	reaper::push_destroyed(process.clone());
	let ends_self = current
		.as_ref()
		.map(|c| c.belongs_to(process))
		.unwrap_or(false);
	if !ends_self {
		drop(lifecycle);
		return;
	}
	// The caller belongs to the process: leave its address space, surrender
	// the thread and reschedule. This never returns.
	cli();
	memory::bind_kernel();
	drop(lifecycle);
	let cur = current.unwrap();
	cur.set_state(ThreadState::Dying);
	cur.set_time_slice(0);
	sti();
	apic::raise_schedule_ipi();
	unreachable!("rescheduled a dying thread");
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::process::blocker::ProcessStateBlocker;

	/// Serializes tests touching the process-global state.
	pub fn world_lock() -> std::sync::MutexGuard<'static, ()> {
		static WORLD: std::sync::Mutex<()> = std::sync::Mutex::new(());
		WORLD.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Drops `process` from the global list, undoing [`push_global`].
	pub fn remove_global(process: &Arc<Process>) {
		PROCESSES.lock().retain(|p| !Arc::ptr_eq(p, process));
	}

	/// Spins until `cond` holds, panicking if it never does.
	pub fn wait_until(cond: impl Fn() -> bool) {
		for _ in 0..10_000_000 {
			if cond() {
				return;
			}
			std::thread::yield_now();
		}
		panic!("condition not reached");
	}

	#[test]
	fn initialize_empty_defaults() {
		let _guard = world_lock();
		let proc = Process::initialize_empty();
		assert_eq!(proc.name(), "unknown");
		assert_eq!(proc.working_dir(), "/");
		assert_eq!(proc.main_thread().tid(), 1);
		assert_eq!(proc.threads().len(), 1);
		assert!(proc.address_space().is_none());
		assert!(!proc.is_dying());
		assert!(!proc.is_dead());
		let disposition = proc.signal_disposition(Signal::SIGTERM);
		assert_eq!(disposition.action, signal::SigAction::Default);
		assert_eq!(disposition.handler, 0);
	}

	#[test]
	fn pid_lookup_and_successor() {
		let _guard = world_lock();
		let procs: Vec<_> = (0..3).map(|_| Process::initialize_empty()).collect();
		for p in &procs {
			push_global(p);
		}
		let pids: Vec<Pid> = procs.iter().map(|p| p.pid()).collect();
		assert!(pids.windows(2).all(|w| w[0] < w[1]));
		for p in &procs {
			assert!(Arc::ptr_eq(&by_pid(p.pid()).unwrap(), p));
		}
		// next_pid_after enumerates live PIDs in increasing order
		let mut cursor = 0;
		let mut seen = Vec::new();
		loop {
			let next = next_pid_after(cursor);
			if next == 0 {
				break;
			}
			if pids.contains(&next) {
				seen.push(next);
			}
			cursor = next;
		}
		assert_eq!(seen, pids);
		for p in &procs {
			remove_global(p);
		}
		assert!(by_pid(pids[0]).is_none());
	}

	#[test]
	fn clone_inherits_identity() {
		let _guard = world_lock();
		let cpus = scheduler::tests::fresh_cpus();
		let parent = Process::initialize_empty();
		parent.set_name("shell");
		parent.set_working_dir("/home");
		push_global(&parent);
		let child = Process::clone_from(&parent);
		assert_eq!(child.name(), "shell");
		assert_eq!(child.working_dir(), "/home");
		assert!(child.pid() > parent.pid());
		assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
		assert!(parent.children().iter().any(|c| Arc::ptr_eq(c, &child)));
		// Unrun until started
		assert!(cpus.iter().all(|c| c.run_queue.lock().is_empty()));
		start(&child);
		assert_eq!(
			cpus.iter().map(|c| c.run_queue.lock().len()).sum::<usize>(),
			1
		);
		remove_global(&parent);
		remove_global(&child);
		scheduler::tests::fresh_cpus();
	}

	#[test]
	fn child_thread_ids_are_sequential() {
		let _guard = world_lock();
		scheduler::tests::fresh_cpus();
		let proc = Process::initialize_empty();
		let t2 = proc.create_child_thread(0x1000, 0x2000, crate::arch::x86::USER_CS, crate::arch::x86::USER_SS);
		let t3 = proc.create_child_thread(0x1000, 0x3000, crate::arch::x86::USER_CS, crate::arch::x86::USER_SS);
		assert_eq!(t2, 2);
		assert_eq!(t3, 3);
		assert_eq!(proc.threads().len(), 3);
		let thread = proc.thread(t2).unwrap();
		assert_eq!(thread.user_stack(), (0x2000, 0x2000));
		scheduler::tests::fresh_cpus();
	}

	#[test]
	fn end_process_lifecycle() {
		let _guard = world_lock();
		let cpus = scheduler::tests::fresh_cpus();
		let parent = Process::initialize_empty();
		push_global(&parent);
		let child = Process::clone_from(&parent);
		start(&child);
		let waiter = ProcessStateBlocker::new();
		waiter.wait_on(&child);
		end(&child);
		assert!(child.is_dead());
		assert!(by_pid(child.pid()).is_none());
		// No queue retains the child's threads
		assert!(cpus.iter().all(|c| c.run_queue.lock().is_empty()));
		// Everyone waiting on the child was unblocked exactly once
		assert!(waiter.ready());
		assert_eq!(waiter.cause(), Some(child.pid()));
		// The parent's thread 1 observes SIGCHLD pending
		assert!(parent.main_thread().pending() & Signal::SIGCHLD.mask_bit() != 0);
		// The parent still observes the dead child
		assert!(parent.children().iter().any(|c| Arc::ptr_eq(c, &child)));
		remove_global(&parent);
		reaper::tests::drain_destroyed();
	}

	#[test]
	fn end_process_waits_for_remote_cpu_to_vacate() {
		let _guard = world_lock();
		let cpus = scheduler::tests::fresh_cpus();
		let parent = Process::initialize_empty();
		push_global(&parent);
		let child = Process::clone_from(&parent);
		let victim = child.main_thread();
		// Put the victim on the other CPU's queue and make it that CPU's
		// current thread, as its dispatcher would
		{
			let mut queue = cpus[1].run_queue.lock();
			queue.push_back(victim.clone());
			cpus[1].update_queue_len(queue.len());
			cpus[1].current.swap(Some(victim.clone()));
		}
		// Stand in for the remote core: once the terminator has quiesced the
		// victim (Blocked, zero slice), hold the wait long enough for the
		// rendezvous to spin, then switch the thread out the way the remote
		// tick would. Taking the queue lock here only succeeds because the
		// terminator releases it between retries.
		let remote = std::thread::spawn({
			let victim = victim.clone();
			let cpus = cpus;
			move || {
				wait_until(|| {
					victim.state() == ThreadState::Blocked && victim.time_slice() == 0
				});
				std::thread::sleep(std::time::Duration::from_millis(20));
				let queue = cpus[1].run_queue.lock();
				cpus[1].current.swap(None);
				drop(queue);
			}
		});
		end(&child);
		remote.join().unwrap();
		// On return, the remote CPU no longer runs the child's thread and
		// its queue is purged
		assert!(child.is_dead());
		assert!(cpus[1].current.get().is_none());
		assert!(cpus[1].run_queue.lock().is_empty());
		assert_eq!(victim.state(), ThreadState::Blocked);
		assert_eq!(victim.time_slice(), 0);
		remove_global(&parent);
		reaper::tests::drain_destroyed();
	}

	#[test]
	fn end_process_ends_live_children_first() {
		let _guard = world_lock();
		scheduler::tests::fresh_cpus();
		let root = Process::initialize_empty();
		push_global(&root);
		let middle = Process::clone_from(&root);
		let leaf = Process::clone_from(&middle);
		end(&root);
		assert!(root.is_dead());
		assert!(middle.is_dead());
		assert!(leaf.is_dead());
		assert!(by_pid(middle.pid()).is_none());
		assert!(by_pid(leaf.pid()).is_none());
		reaper::tests::drain_destroyed();
	}

	#[test]
	fn end_process_destroys_handles() {
		use crate::process::handle::KernelObject;
		use core::sync::atomic::AtomicUsize;

		struct Obj(AtomicUsize);
		impl KernelObject for Obj {
			fn destroy(&self) {
				self.0.fetch_add(1, Relaxed);
			}
		}

		let _guard = world_lock();
		scheduler::tests::fresh_cpus();
		let proc = Process::initialize_empty();
		push_global(&proc);
		let obj = Arc::new(Obj(AtomicUsize::new(0)));
		proc.handles.register(obj.clone());
		end(&proc);
		assert_eq!(obj.0.load(Relaxed), 1);
		reaper::tests::drain_destroyed();
	}

	#[test]
	fn dying_parent_gets_no_sigchld() {
		let _guard = world_lock();
		scheduler::tests::fresh_cpus();
		let parent = Process::initialize_empty();
		push_global(&parent);
		let child = Process::clone_from(&parent);
		// The parent dies with the child: the recursion must not signal it
		end(&parent);
		assert!(child.is_dead());
		assert_eq!(
			parent.main_thread().pending() & Signal::SIGCHLD.mask_bit(),
			0
		);
		reaper::tests::drain_destroyed();
	}
}
