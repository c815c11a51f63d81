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

//! Program execution: building a user-mode process from an executable image.
//!
//! Creation populates a fresh address space with the image's segments (and
//! the dynamic linker's, when one is required), builds the initial user
//! stack (argv, envp, auxiliary vector), reserves the standard descriptors
//! and installs the signal trampoline. The new process is left unrun;
//! [`start`](crate::process::start) makes it runnable.

pub mod elf;

use crate::{
	arch::x86::{USER_CS, USER_SS},
	file::{vfs, FileDescriptor},
	memory::{AddressSpace, MemError, PAGE_SIZE},
	process,
	process::{
		signal::trampoline,
		thread::{DEFAULT_TIME_SLICE, USER_PRIORITY},
		Process,
	},
};
use alloc::{sync::Arc, vec::Vec};
use elf::{ElfInfo, AT_ENTRY, AT_EXECPATH, AT_NULL, AT_PHDR, AT_PHENT, AT_PHNUM};

/// The size of a process's user stack region.
pub const USER_STACK_SIZE: usize = 0x40_0000;
/// The number of stack pages pre-faulted at the top of the region.
const STACK_PREFAULT_PAGES: usize = 3;
/// The fixed base address at which the dynamic linker is loaded.
const INTERP_BASE: u64 = 0x7f_c000_0000;
/// The path of the dynamic linker.
const INTERP_PATH: &str = "/lib/ld.so";

/// Process-creation errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecError {
	/// The loader rejected the executable image.
	InvalidImage,
	/// Mapping the image or building the initial stack failed; the partially
	/// constructed process was torn down.
	LoadFailure,
}

/// Builds a user-mode process from the executable `image`.
///
/// `argv` and `envp` are copied onto the new process's stack; `exec_path`,
/// when given, is exposed through the `AT_EXECPATH` auxiliary entry.
///
/// The descriptors 0, 1 and 2 are opened onto `/dev/null` and
/// `/dev/kernellog`; a missing device is tolerated with a vacant entry and a
/// warning.
///
/// # Panics
///
/// Panics if the image requires a dynamic linker and none is resolvable:
/// user space cannot be brought up without it.
pub fn create_elf_process(
	image: &[u8],
	argv: &[&str],
	envp: &[&str],
	exec_path: Option<&str>,
) -> Result<Arc<Process>, ExecError> {
	elf::verify(image)?;
	let proc = Process::initialize_empty();
	let mut space = AddressSpace::new();
	let thread = proc.main_thread();
	thread.set_priority(USER_PRIORITY);
	thread.set_default_time_slice(DEFAULT_TIME_SLICE);
	thread.set_time_slice(DEFAULT_TIME_SLICE);
	let info = elf::load(&mut space, image, 0)?;
	// The user stack region, top pages pre-faulted
	let stack_base = space.alloc_anonymous(USER_STACK_SIZE);
	let stack_top = stack_base + USER_STACK_SIZE as u64;
	for i in 1..=STACK_PREFAULT_PAGES {
		space.prefault(stack_top - (i * PAGE_SIZE) as u64);
	}
	let mut entry = info.entry;
	if let Some(interpreter) = &info.interpreter {
		// The dynamic linker gets control first, at its own base
		let Some(node) = vfs::resolve_path(INTERP_PATH) else {
			panic!("Failed to load dynamic linker! (image requires {interpreter})");
		};
		let linker = vfs::read_all(&node);
		if elf::verify(&linker).is_err() {
			log::warn!("Invalid dynamic linker ELF");
			return Err(ExecError::LoadFailure);
		}
		let linker_info = elf::load(&mut space, &linker, INTERP_BASE)?;
		entry = linker_info.entry;
	}
	let rsp = build_initial_stack(&mut space, stack_top, argv, envp, exec_path, &info)
		.map_err(|_| ExecError::LoadFailure)?;
	debug_assert_eq!(rsp % 16, 0);
	{
		let mut regs = thread.regs.lock();
		*regs = crate::arch::x86::idt::IntFrame::new_with_segments(entry, rsp, USER_CS, USER_SS);
	}
	thread.set_user_stack(stack_base, stack_top);
	// Reserve descriptors 0, 1 and 2 for stdin, stdout and stderr
	match vfs::resolve_path("/dev/null") {
		Some(node) => {
			proc.push_fd(Some(FileDescriptor::open(node)));
		}
		None => {
			proc.push_fd(None);
			log::warn!("Failed to find /dev/null");
		}
	}
	match vfs::resolve_path("/dev/kernellog") {
		Some(node) => {
			proc.push_fd(Some(FileDescriptor::open(node.clone())));
			proc.push_fd(Some(FileDescriptor::open(node)));
		}
		None => {
			proc.push_fd(None);
			proc.push_fd(None);
			log::warn!("Failed to find /dev/kernellog");
		}
	}
	// Install the signal trampoline in a dedicated, fully materialized region
	let blob = trampoline::bytes();
	let tramp_base = space.alloc_anonymous(blob.len().next_multiple_of(PAGE_SIZE).max(PAGE_SIZE));
	space.force_allocate(tramp_base);
	space
		.write(tramp_base, blob)
		.map_err(|_| ExecError::LoadFailure)?;
	proc.set_signal_trampoline(tramp_base);
	*proc.address_space() = Some(space);
	process::push_global(&proc);
	Ok(proc)
}

/// Lays out the initial user stack and returns the resulting stack pointer,
/// 16-byte aligned.
///
/// From the stack top downward: the string area (argv, envp and the exec
/// path), then, below the aligned pointer area: the auxiliary vector
/// (terminated by `AT_NULL`), the null-terminated envp pointer array, the
/// null-terminated argv pointer array, and finally `argc`.
fn build_initial_stack(
	space: &mut AddressSpace,
	stack_top: u64,
	argv: &[&str],
	envp: &[&str],
	exec_path: Option<&str>,
	info: &ElfInfo,
) -> Result<u64, MemError> {
	let mut sp = stack_top;
	let mut write_string = |sp: &mut u64, s: &str| -> Result<u64, MemError> {
		*sp -= s.len() as u64 + 1;
		space.write(*sp, s.as_bytes())?;
		space.write(*sp + s.len() as u64, &[0])?;
		Ok(*sp)
	};
	let argv_ptrs = argv
		.iter()
		.map(|arg| write_string(&mut sp, arg))
		.collect::<Result<Vec<u64>, _>>()?;
	let envp_ptrs = envp
		.iter()
		.map(|env| write_string(&mut sp, env))
		.collect::<Result<Vec<u64>, _>>()?;
	let exec_path_ptr = exec_path
		.map(|path| write_string(&mut sp, path))
		.transpose()?;
	// Align the pointer area
	sp &= !0xf;
	// Built in ascending order from the final stack pointer
	let mut words: Vec<u64> = Vec::new();
	words.push(argv.len() as u64);
	words.extend(&argv_ptrs);
	words.push(0);
	words.extend(&envp_ptrs);
	words.push(0);
	if let Some(ptr) = exec_path_ptr {
		words.push(AT_EXECPATH);
		words.push(ptr);
	}
	words.push(AT_ENTRY);
	words.push(info.entry);
	words.push(AT_PHNUM);
	words.push(info.phnum);
	words.push(AT_PHENT);
	words.push(info.phent);
	words.push(AT_PHDR);
	words.push(info.phdr);
	words.push(AT_NULL);
	// If argc plus the environment count is odd, the area above would leave
	// the final pointer misaligned: pad one word
	if (argv.len() + envp.len()) % 2 == 1 {
		words.push(0);
	}
	sp -= (words.len() * 8) as u64;
	let mut bytes = Vec::with_capacity(words.len() * 8);
	for word in &words {
		bytes.extend_from_slice(&word.to_le_bytes());
	}
	space.write(sp, &bytes)?;
	Ok(sp)
}
