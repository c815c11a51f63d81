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

//! Synchronization primitives.
//!
//! Plain spinlocks come from the `spin` crate. This module adds the
//! interrupt-masking variant required by the scheduler's locking discipline,
//! and an atomic [`Arc`](alloc::sync::Arc) cell.

mod arc;
mod spinlock;

pub use arc::AtomicArc;
pub use spinlock::{IntSpin, IntSpinGuard};
