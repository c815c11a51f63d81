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

//! Per-CPU run queue.
//!
//! The queue chains its threads into an intrusive circular doubly-linked
//! list, in insertion order. The ring is load-bearing: walking past blocked
//! threads in the dispatcher requires O(1) neighbour access.
//!
//! The queue owns one strong reference to each member. All link manipulation
//! happens through `&mut self`, which the surrounding spinlock provides.

use crate::process::Thread;
use alloc::sync::Arc;
use core::ptr;

/// A CPU's run queue: a circular list of the threads assigned to that CPU.
///
/// The idle thread is never a member.
pub struct RunQueue {
	/// The front of the ring; null when empty.
	front: *const Thread,
	len: usize,
}

// Safety: members are only reachable through `&mut self`, protected by the
// owning CPU's run-queue lock.
unsafe impl Send for RunQueue {}

impl RunQueue {
	/// Creates an empty queue.
	pub const fn new() -> Self {
		Self {
			front: ptr::null(),
			len: 0,
		}
	}

	/// Returns the number of threads in the queue.
	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Tells whether the queue is empty.
	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Appends `thread` at the back of the ring.
	pub fn push_back(&mut self, thread: Arc<Thread>) {
		let ptr = Arc::into_raw(thread);
		unsafe {
			if self.front.is_null() {
				(*ptr).links.set(ptr, ptr);
				self.front = ptr;
			} else {
				let front = self.front;
				let (back, _) = (*front).links.get();
				(*ptr).links.set(back, front);
				let (back_prev, _) = (*back).links.get();
				(*back).links.set(back_prev, ptr);
				let (_, front_next) = (*front).links.get();
				(*front).links.set(ptr, front_next);
			}
		}
		self.len += 1;
	}

	/// Tells whether `thread` is a member of the queue.
	pub fn contains(&self, thread: &Thread) -> bool {
		self.iter().any(|t| ptr::eq(t, thread))
	}

	/// Unlinks `thread` from the ring, returning the ownership the queue
	/// held. Returns `None` if `thread` is not a member.
	pub fn remove(&mut self, thread: &Thread) -> Option<Arc<Thread>> {
		if !self.contains(thread) {
			return None;
		}
		let target = thread as *const Thread;
		unsafe {
			let (prev, next) = (*target).links.get();
			if self.len == 1 {
				self.front = ptr::null();
			} else {
				let (prev_prev, _) = (*prev).links.get();
				(*prev).links.set(prev_prev, next);
				let (_, next_next) = (*next).links.get();
				(*next).links.set(prev, next_next);
				if self.front == target {
					self.front = next;
				}
			}
			(*target).links.set(ptr::null(), ptr::null());
			self.len -= 1;
			Some(Arc::from_raw(target))
		}
	}

	/// Returns the front of the ring.
	pub fn front(&self) -> Option<&Thread> {
		if self.front.is_null() {
			None
		} else {
			Some(unsafe { &*self.front })
		}
	}

	/// Returns a new reference to the front of the ring.
	pub fn front_arc(&self) -> Option<Arc<Thread>> {
		self.front().map(|t| unsafe { arc_from_member(t) })
	}

	/// Returns the successor of `thread` in the ring.
	///
	/// `thread` must be a member of the queue.
	pub fn next_of<'q>(&'q self, thread: &Thread) -> &'q Thread {
		debug_assert!(self.contains(thread));
		unsafe {
			let (_, next) = thread.links.get();
			&*next
		}
	}

	/// Returns a new reference to the successor of `thread` in the ring.
	///
	/// `thread` must be a member of the queue.
	pub fn next_arc(&self, thread: &Thread) -> Arc<Thread> {
		unsafe { arc_from_member(self.next_of(thread)) }
	}

	/// Iterates over the ring in insertion order, starting at the front.
	pub fn iter(&self) -> Iter<'_> {
		Iter {
			queue: self,
			cur: self.front,
			remaining: self.len,
		}
	}

	/// Removes every member matching `predicate`, dropping the queue's
	/// references. Returns the number of threads removed.
	pub fn remove_matching(&mut self, predicate: impl Fn(&Thread) -> bool) -> usize {
		let targets: alloc::vec::Vec<*const Thread> = self
			.iter()
			.filter(|t| predicate(t))
			.map(|t| t as *const Thread)
			.collect();
		let count = targets.len();
		for target in targets {
			unsafe {
				self.remove(&*target);
			}
		}
		count
	}
}

/// Turns a queue member reference into a new owned reference.
///
/// # Safety
///
/// `thread` must be a queue member, so that the queue holds a strong
/// reference backing the pointer.
unsafe fn arc_from_member(thread: &Thread) -> Arc<Thread> {
	let ptr = thread as *const Thread;
	Arc::increment_strong_count(ptr);
	Arc::from_raw(ptr)
}

impl Drop for RunQueue {
	fn drop(&mut self) {
		while let Some(front) = self.front() {
			let front = front as *const Thread;
			unsafe {
				self.remove(&*front);
			}
		}
	}
}

/// Iterator over the members of a [`RunQueue`].
pub struct Iter<'q> {
	#[allow(dead_code)]
	queue: &'q RunQueue,
	cur: *const Thread,
	remaining: usize,
}

impl<'q> Iterator for Iter<'q> {
	type Item = &'q Thread;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}
		self.remaining -= 1;
		let cur = unsafe { &*self.cur };
		self.cur = unsafe { cur.links.get().1 };
		Some(cur)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		arch::x86::idt::IntFrame,
		process::thread::{ThreadState, DEFAULT_TIME_SLICE, USER_PRIORITY},
	};
	use alloc::sync::Weak;

	fn make_thread(tid: u64) -> Arc<Thread> {
		Thread::new(
			&Weak::new(),
			tid,
			USER_PRIORITY,
			DEFAULT_TIME_SLICE,
			IntFrame::default(),
		)
	}

	#[test]
	fn push_and_iterate_in_order() {
		let mut queue = RunQueue::new();
		let threads: alloc::vec::Vec<_> = (1..=4).map(make_thread).collect();
		for t in &threads {
			queue.push_back(t.clone());
		}
		assert_eq!(queue.len(), 4);
		let tids: alloc::vec::Vec<u64> = queue.iter().map(|t| t.tid()).collect();
		assert_eq!(tids, [1, 2, 3, 4]);
	}

	#[test]
	fn ring_wraps() {
		let mut queue = RunQueue::new();
		let threads: alloc::vec::Vec<_> = (1..=3).map(make_thread).collect();
		for t in &threads {
			queue.push_back(t.clone());
		}
		let front = queue.front().unwrap();
		let second = queue.next_of(front);
		let third = queue.next_of(second);
		let wrapped = queue.next_of(third);
		assert!(ptr::eq(front, wrapped));
	}

	#[test]
	fn remove_middle() {
		let mut queue = RunQueue::new();
		let threads: alloc::vec::Vec<_> = (1..=3).map(make_thread).collect();
		for t in &threads {
			queue.push_back(t.clone());
		}
		let removed = queue.remove(&threads[1]).unwrap();
		assert!(Arc::ptr_eq(&removed, &threads[1]));
		assert_eq!(queue.len(), 2);
		let tids: alloc::vec::Vec<u64> = queue.iter().map(|t| t.tid()).collect();
		assert_eq!(tids, [1, 3]);
		// Removing a non-member is a no-op
		assert!(queue.remove(&threads[1]).is_none());
	}

	#[test]
	fn remove_front_moves_front() {
		let mut queue = RunQueue::new();
		let threads: alloc::vec::Vec<_> = (1..=2).map(make_thread).collect();
		for t in &threads {
			queue.push_back(t.clone());
		}
		queue.remove(&threads[0]).unwrap();
		assert_eq!(queue.front().unwrap().tid(), 2);
		queue.remove(&threads[1]).unwrap();
		assert!(queue.front().is_none());
		assert!(queue.is_empty());
	}

	#[test]
	fn queue_owns_reference() {
		let mut queue = RunQueue::new();
		let thread = make_thread(1);
		queue.push_back(thread.clone());
		assert_eq!(Arc::strong_count(&thread), 2);
		drop(queue);
		assert_eq!(Arc::strong_count(&thread), 1);
	}

	#[test]
	fn membership_is_exclusive_after_removal() {
		// A thread removed from one queue can be pushed onto another, and is
		// a member of at most one at any time.
		let mut q0 = RunQueue::new();
		let mut q1 = RunQueue::new();
		let thread = make_thread(1);
		q0.push_back(thread.clone());
		assert!(q0.contains(&thread));
		assert!(!q1.contains(&thread));
		let owned = q0.remove(&thread).unwrap();
		q1.push_back(owned);
		assert!(!q0.contains(&thread));
		assert!(q1.contains(&thread));
	}

	#[test]
	fn remove_matching_by_state() {
		let mut queue = RunQueue::new();
		let threads: alloc::vec::Vec<_> = (1..=4).map(make_thread).collect();
		for t in &threads {
			queue.push_back(t.clone());
		}
		threads[0].set_state(ThreadState::Zombie);
		threads[2].set_state(ThreadState::Zombie);
		let removed = queue.remove_matching(|t| t.state() == ThreadState::Zombie);
		assert_eq!(removed, 2);
		let tids: alloc::vec::Vec<u64> = queue.iter().map(|t| t.tid()).collect();
		assert_eq!(tids, [2, 4]);
	}
}
