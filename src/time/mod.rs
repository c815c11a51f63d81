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

//! Time keeping.
//!
//! The periodic timer interrupt is the scheduler's tick source; this module
//! counts the ticks and provides the microsecond wait used by cooperative
//! kernel threads.

use crate::{arch::x86::hlt, process::scheduler};
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// The period of the timer tick, in microseconds.
pub const TICK_PERIOD_US: u64 = 1000;

/// Number of timer ticks since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advances the uptime by one tick. Called from the timer interrupt.
pub(crate) fn on_tick() {
	TICKS.fetch_add(1, Relaxed);
}

/// Returns the number of timer ticks since boot.
pub fn uptime_ticks() -> u64 {
	TICKS.load(Relaxed)
}

/// Returns the uptime in microseconds.
pub fn uptime_us() -> u64 {
	uptime_ticks() * TICK_PERIOD_US
}

/// Waits for at least `us` microseconds, yielding the CPU while waiting.
///
/// Before the scheduler is ready there is no tick source, so the wait
/// degrades to a no-op.
pub fn wait_us(us: u64) {
	if !scheduler::is_ready() {
		return;
	}
	let target = uptime_us() + us;
	while uptime_us() < target {
		scheduler::yield_now();
		hlt();
	}
}
