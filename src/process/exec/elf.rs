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

//! ELF image handling.
//!
//! Verifies executables and maps their `PT_LOAD` segments into an address
//! space, reporting the entry point and the program-header metadata the
//! initial stack's auxiliary vector needs.

use super::ExecError;
use crate::memory::AddressSpace;
use alloc::string::{String, ToString};
use xmas_elf::{
	header,
	header::{Class, Data, Machine, Type as ElfType},
	program::Type as PhType,
	ElfFile,
};

/// Auxiliary vector entry: end of vector.
pub const AT_NULL: u64 = 0;
/// Auxiliary vector entry: address of the program-header table.
pub const AT_PHDR: u64 = 3;
/// Auxiliary vector entry: size of one program-header entry.
pub const AT_PHENT: u64 = 4;
/// Auxiliary vector entry: number of program-header entries.
pub const AT_PHNUM: u64 = 5;
/// Auxiliary vector entry: the image's entry point.
pub const AT_ENTRY: u64 = 9;
/// Auxiliary vector entry: address of the executable's path string.
pub const AT_EXECPATH: u64 = 15;

/// Metadata the loader reports about a mapped image.
pub struct ElfInfo {
	/// The image's entry point.
	pub entry: u64,
	/// The virtual address of the program-header table.
	pub phdr: u64,
	/// The size of one program-header entry.
	pub phent: u64,
	/// The number of program-header entries.
	pub phnum: u64,
	/// The dynamic linker's path, for images that require one.
	pub interpreter: Option<String>,
}

/// Validates `image` as a 64-bit x86 executable.
pub fn verify(image: &[u8]) -> Result<(), ExecError> {
	let elf = ElfFile::new(image).map_err(|_| ExecError::InvalidImage)?;
	header::sanity_check(&elf).map_err(|_| ExecError::InvalidImage)?;
	let hdr = &elf.header;
	if !matches!(hdr.pt1.class(), Class::SixtyFour) {
		return Err(ExecError::InvalidImage);
	}
	if !matches!(hdr.pt1.data(), Data::LittleEndian) {
		return Err(ExecError::InvalidImage);
	}
	if hdr.pt2.machine().as_machine() != Machine::X86_64 {
		return Err(ExecError::InvalidImage);
	}
	if !matches!(
		hdr.pt2.type_().as_type(),
		ElfType::Executable | ElfType::SharedObject
	) {
		return Err(ExecError::InvalidImage);
	}
	Ok(())
}

/// Maps the image's `PT_LOAD` segments into `space`, every address offset by
/// `base` (zero for the main executable, the fixed high base for the dynamic
/// linker).
pub fn load(space: &mut AddressSpace, image: &[u8], base: u64) -> Result<ElfInfo, ExecError> {
	let elf = ElfFile::new(image).map_err(|_| ExecError::InvalidImage)?;
	let mut phdr = 0;
	let mut interpreter = None;
	for ph in elf.program_iter() {
		let ph_type = ph.get_type().map_err(|_| ExecError::InvalidImage)?;
		match ph_type {
			PhType::Load => {
				let mem_size = ph.mem_size();
				if mem_size == 0 {
					continue;
				}
				let file_size = ph.file_size();
				if file_size > mem_size {
					return Err(ExecError::InvalidImage);
				}
				let offset = ph.offset() as usize;
				let data = image
					.get(offset..offset + file_size as usize)
					.ok_or(ExecError::InvalidImage)?;
				let vaddr = base + ph.virtual_addr();
				space
					.map_fixed(vaddr, mem_size)
					.map_err(|_| ExecError::LoadFailure)?;
				// The tail past `file_size` is BSS and stays zeroed
				space.write(vaddr, data).map_err(|_| ExecError::LoadFailure)?;
			}
			PhType::Phdr => phdr = base + ph.virtual_addr(),
			PhType::Interp => {
				let offset = ph.offset() as usize;
				let data = image
					.get(offset..offset + ph.file_size() as usize)
					.ok_or(ExecError::InvalidImage)?;
				let path = data.split(|b| *b == 0).next().unwrap_or(&[]);
				let path = core::str::from_utf8(path).map_err(|_| ExecError::InvalidImage)?;
				interpreter = Some(path.to_string());
			}
			_ => {}
		}
	}
	// Without a PT_PHDR segment, locate the table inside the segment that
	// covers its file offset
	if phdr == 0 {
		let ph_offset = elf.header.pt2.ph_offset();
		for ph in elf.program_iter() {
			if ph.get_type() != Ok(PhType::Load) {
				continue;
			}
			if ph.offset() <= ph_offset && ph_offset < ph.offset() + ph.file_size() {
				phdr = base + ph.virtual_addr() + (ph_offset - ph.offset());
				break;
			}
		}
	}
	Ok(ElfInfo {
		entry: base + elf.header.pt2.entry_point(),
		phdr,
		phent: elf.header.pt2.ph_entry_size() as u64,
		phnum: elf.header.pt2.ph_count() as u64,
		interpreter,
	})
}
