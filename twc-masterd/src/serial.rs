// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The only I/O this daemon owns: a 9600-baud 8N1 RS-485 line, opened
//! non-blocking for reads. Transport is behind a small trait so the
//! main loop can be driven in tests by an in-memory fake instead of a
//! real character device.

use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::{DataBits, Parity, StopBits};

/// Bytewise access to the bus. A zero-byte `read` is not an error: it
/// means "nothing available yet", the non-blocking contract the state
/// machine's drain loop relies on.
pub trait SerialPort {
    /// Reads whatever is immediately available into `buf`, returning the
    /// number of bytes read (0 is legal and means "try again").
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Writes `bytes` to the wire, blocking until they're sent.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;
}

/// A real RS-485 adapter, opened 9600 8N1 with a short read timeout so
/// `read_available` can poll without blocking the main loop.
pub struct RealSerialPort {
    inner: Box<dyn serialport::SerialPort>,
}

impl RealSerialPort {
    pub fn open(device: &str) -> Result<Self> {
        let inner = serialport::new(device, 9600)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(20))
            .open()
            .with_context(|| format!("opening serial device {device}"))?;
        Ok(Self { inner })
    }
}

impl SerialPort for RealSerialPort {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(e).context("reading from serial device"),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).context("writing to serial device")
    }
}

/// In-memory stand-in for tests: reads drain a fixed input buffer in
/// one shot (never "partial"), writes accumulate into an output buffer
/// the test can inspect afterward. Exposed (not test-gated) so
/// integration tests in `tests/` can drive the main loop without a
/// real character device.
pub struct FakeSerialPort {
    pub inbound: std::collections::VecDeque<u8>,
    pub outbound: Vec<u8>,
}

impl FakeSerialPort {
    pub fn new(inbound: Vec<u8>) -> Self {
        Self { inbound: inbound.into(), outbound: Vec::new() }
    }
}

impl SerialPort for FakeSerialPort {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }
}
