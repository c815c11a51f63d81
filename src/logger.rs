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

//! Kernel logger.
//!
//! Backend for the `log` facade: records go to the serial console and to an
//! in-memory ring buffer. The ring buffer backs the `/dev/kernellog` device
//! node.

use core::fmt::Write;
use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

/// The size of the in-memory log ring, in bytes.
const RING_SIZE: usize = 1 << 16;
/// The COM1 serial port.
#[cfg(not(test))]
const SERIAL_PORT: u16 = 0x3f8;

/// Fixed-size byte ring keeping the most recent log output.
struct LogRing {
	buf: [u8; RING_SIZE],
	/// Total number of bytes ever written.
	written: usize,
}

static RING: Mutex<LogRing> = Mutex::new(LogRing {
	buf: [0; RING_SIZE],
	written: 0,
});

/// Writes a byte to the serial console.
fn serial_write_byte(b: u8) {
	#[cfg(test)]
	let _ = b;
	#[cfg(not(test))]
	unsafe {
		x86_64::instructions::port::Port::<u8>::new(SERIAL_PORT).write(b);
	}
}

/// Appends raw bytes to the log: serial console and ring buffer.
pub fn write_bytes(data: &[u8]) {
	let mut ring = RING.lock();
	for &b in data {
		let i = ring.written % RING_SIZE;
		ring.buf[i] = b;
		ring.written += 1;
		serial_write_byte(b);
	}
}

/// Reads from the retained log content at `off`, returning the number of
/// bytes read.
pub fn read_ring(off: usize, buf: &mut [u8]) -> usize {
	let ring = RING.lock();
	let len = ring.written.min(RING_SIZE);
	let start = ring.written - len;
	if off >= len {
		return 0;
	}
	let n = buf.len().min(len - off);
	for (i, b) in buf[..n].iter_mut().enumerate() {
		*b = ring.buf[(start + off + i) % RING_SIZE];
	}
	n
}

/// Adapter turning `core::fmt` output into log bytes.
struct LogWriter;

impl Write for LogWriter {
	fn write_str(&mut self, s: &str) -> core::fmt::Result {
		write_bytes(s.as_bytes());
		Ok(())
	}
}

struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let _ = writeln!(LogWriter, "[{}] {}", record.level(), record.args());
	}

	fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger as the `log` backend.
pub fn init() {
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(LevelFilter::Info);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_round_trip() {
		write_bytes(b"ring test line\n");
		let mut buf = [0u8; RING_SIZE];
		let n = read_ring(0, &mut buf);
		assert!(n > 0);
		let content = &buf[..n];
		assert!(content
			.windows(b"ring test line".len())
			.any(|w| w == b"ring test line"));
	}
}
