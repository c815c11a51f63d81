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

//! Symmetric multiprocessing support.
//!
//! The application processors are started by the platform bring-up code; the
//! scheduler only needs to know which core it is running on.

use super::apic;

/// Returns the index of the current core.
///
/// Cores are indexed by their local APIC ID, which the platform bring-up
/// code arranges to be contiguous from zero.
#[inline]
pub fn core_id() -> usize {
	apic::lapic_id() as usize
}
