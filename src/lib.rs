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

//! Sonata is a small Unix-like kernel for 64-bit x86.
//!
//! The core of the crate is a preemptive, per-CPU multiprocessor scheduler:
//! run queues, time slicing, context switching, signal delivery on return to
//! user mode, process lifecycle and per-process kernel-object handles live
//! under [`process`]. The memory, filesystem and timer subsystems are narrow
//! collaborators consumed through the facades in [`memory`], [`file`] and
//! [`time`].
//!
//! Unit tests run hosted: every privileged instruction is wrapped in
//! [`arch::x86`] and compiles to a no-op in test builds.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod file;
pub mod logger;
pub mod memory;
pub mod process;
pub mod sync;
pub mod time;

use crate::{
	file::vfs,
	process::{exec, reaper, Process},
};
use alloc::vec::Vec;
use spin::Once;

/// The path to the init program.
const INIT_PATH: &str = "/system/sonata/init.lef";
/// The path to the fallback program, used when [`INIT_PATH`] cannot be resolved.
const INIT_FALLBACK_PATH: &str = "/initrd/fterm.lef";
/// The path to the kernel symbol map, loaded for panic diagnostics.
const SYMBOL_MAP_PATH: &str = "/initrd/kernel.map";

/// The kernel symbol map, retained for panic diagnostics.
static SYMBOL_MAP: Once<Vec<u8>> = Once::new();

/// Initializes the kernel and enters the scheduler.
///
/// `cpu_count` is the number of hardware threads released by the platform
/// bring-up code.
///
/// The function installs the logger, creates the per-CPU scheduler state, the
/// kernel main thread and the reaper, then becomes the boot CPU's idle loop.
/// It never returns.
pub fn init(cpu_count: usize) -> ! {
	logger::init();
	vfs::init();
	process::scheduler::setup(cpu_count);
	let kproc = Process::create_kernel(kernel_main);
	kproc.set_name("kernel");
	let reaper_proc = Process::create_kernel(reaper::reaper_main);
	reaper_proc.set_name("reaper");
	process::scheduler::start();
}

/// The kernel's main thread: performs the boot checks, then loads and starts
/// the init process.
fn kernel_main() -> ! {
	// Boot fatal checks
	let Some(symbols) = vfs::resolve_path(SYMBOL_MAP_PATH) else {
		panic!("Failed to locate {SYMBOL_MAP_PATH}!");
	};
	SYMBOL_MAP.call_once(|| vfs::read_all(&symbols));
	log::info!("Loading init process...");
	let init_node = vfs::resolve_path(INIT_PATH)
		.or_else(|| vfs::resolve_path(INIT_FALLBACK_PATH))
		.unwrap_or_else(|| {
			panic!("Failed to load either init task (init.lef) or fterm (fterm.lef)!")
		});
	let image = vfs::read_all(&init_node);
	let init_proc = exec::create_elf_process(&image, &["init.lef"], &["PATH=/initrd"], None)
		.unwrap_or_else(|err| panic!("Failed to create init process: {err:?}"));
	init_proc.set_name("Init");
	init_proc.set_working_dir("/");
	process::start(&init_proc);
	log::info!("OK");
	loop {
		process::Thread::sleep(1_000_000);
	}
}
