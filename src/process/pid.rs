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

//! PIDs handling.
//!
//! Each process has a unique PID, allocated monotonically from 1. PIDs are
//! never reused for the lifetime of the system, so a counter is enough.

use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Type representing a Process ID. This ID is unique for every process ever
/// created.
pub type Pid = u64;

/// The next PID to be allocated.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh PID.
pub fn allocate() -> Pid {
	NEXT_PID.fetch_add(1, Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_unique() {
		let first = allocate();
		let mut prev = first;
		for _ in 0..100 {
			let pid = allocate();
			assert!(pid > prev);
			prev = pid;
		}
	}

	#[test]
	fn concurrent_allocations_distinct() {
		let handles: alloc::vec::Vec<_> = (0..8)
			.map(|_| std::thread::spawn(|| (0..100).map(|_| allocate()).collect::<alloc::vec::Vec<_>>()))
			.collect();
		let mut all: alloc::vec::Vec<Pid> = handles
			.into_iter()
			.flat_map(|h| h.join().unwrap())
			.collect();
		let count = all.len();
		all.sort_unstable();
		all.dedup();
		assert_eq!(all.len(), count);
	}
}
