// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SLIP-derived byte-stuffed framing: escaping, checksum, and a
//! noise-tolerant receive-assembly state machine.
//!
//! Modeled after the pack's framed-message library (`host-sp-messages`),
//! which pairs a `try_serialize`/`deserialize` free-function API with a
//! typed decode-failure enum. We hand-roll the checksum here (a one-line
//! wrapping sum) rather than pull in a CRC/fletcher crate, since the wire
//! format mandates this exact algorithm.

use std::time::{Duration, Instant};

use crate::error::FrameError;

const DELIMITER: u8 = 0xC0;
const ESCAPE: u8 = 0xDB;
const ESCAPED_DELIMITER: u8 = 0xDC;
const ESCAPED_ESCAPE: u8 = 0xDD;

/// Payload lengths the rest of the crate knows how to parse.
const VALID_LENGTHS: [usize; 3] = [14, 16, 20];

const DISCARD_BELOW: usize = 15;
const TERMINATE_AT: usize = 16;
const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sum, modulo 256, of `payload[1..]`. The first payload byte (the high
/// opcode byte) is excluded by the wire format's own definition.
fn checksum(payload: &[u8]) -> u8 {
    payload[1..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn escape_into(out: &mut Vec<u8>, byte: u8) {
    match byte {
        DELIMITER => out.extend_from_slice(&[ESCAPE, ESCAPED_DELIMITER]),
        ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
        b => out.push(b),
    }
}

/// Escapes `payload`, appends its checksum, and wraps the result in
/// `0xC0` delimiters, ready to write to the wire.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let sum = checksum(payload);

    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(DELIMITER);
    for &b in payload {
        escape_into(&mut out, b);
    }
    escape_into(&mut out, sum);
    out.push(DELIMITER);
    out
}

/// Unescapes the bytes collected between (and excluding) a frame's
/// opening and closing `0xC0`, verifies the trailing checksum, and
/// returns the payload with the checksum byte stripped.
///
/// `inner` is the raw, still-escaped bytes as they arrived on the wire:
/// no leading or trailing `0xC0`.
pub fn decode_frame(inner: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut unescaped = Vec::with_capacity(inner.len());
    let mut bad_escape = false;
    let mut i = 0;
    while i < inner.len() {
        if inner[i] == ESCAPE {
            match inner.get(i + 1) {
                Some(&ESCAPED_DELIMITER) => {
                    unescaped.push(DELIMITER);
                    i += 2;
                }
                Some(&ESCAPED_ESCAPE) => {
                    unescaped.push(ESCAPE);
                    i += 2;
                }
                _ => {
                    // Corrupt escape: fold to a bare 0xDB and keep going,
                    // same as the original tool. The checksum decides
                    // whether the frame survives.
                    bad_escape = true;
                    unescaped.push(ESCAPE);
                    i += 1;
                }
            }
        } else {
            unescaped.push(inner[i]);
            i += 1;
        }
    }

    // The 14/16/20 lengths the wire format promises include the trailing
    // checksum byte (this is what TWC firmware itself checks), so we
    // validate before stripping it.
    if !VALID_LENGTHS.contains(&unescaped.len()) {
        return Err(FrameError::BadLength(unescaped.len()));
    }

    let checksum_byte = unescaped[unescaped.len() - 1];
    let payload = &unescaped[..unescaped.len() - 1];
    let expected = checksum(payload);
    if expected != checksum_byte {
        return Err(FrameError::ChecksumMismatch {
            expected,
            found: checksum_byte,
        });
    }
    if bad_escape {
        return Err(FrameError::BadEscape);
    }

    Ok(payload.to_vec())
}

/// Accumulates raw bytes off the wire into delimited frames, tolerating
/// mid-stream garbage the same way TWC firmware does.
///
/// The caller feeds bytes in as they arrive via [`push_byte`](Self::push_byte)
/// and polls [`check_timeout`](Self::check_timeout) on its own tick so a
/// stalled peer doesn't wedge assembly forever.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// Raw bytes collected since (and including) the opening `0xC0`.
    /// Empty between frames.
    buf: Vec<u8>,
    last_byte_at: Option<Instant>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte from the wire. Returns `Some` once a frame has
    /// been delimited, whether or not it ultimately decodes cleanly.
    pub fn push_byte(&mut self, byte: u8, now: Instant) -> Option<Result<Vec<u8>, FrameError>> {
        self.last_byte_at = Some(now);

        if self.buf.is_empty() {
            if byte == DELIMITER {
                self.buf.push(byte);
            }
            // Anything else between frames is noise; ignore it.
            return None;
        }

        if byte == DELIMITER {
            if self.buf.len() < DISCARD_BELOW {
                // Too short to be a real frame; the TWC bus is noisy
                // enough that this happens. Restart with this 0xC0 as
                // the new opener.
                self.buf.clear();
                self.buf.push(DELIMITER);
                return None;
            }
            self.buf.push(byte);
            if self.buf.len() >= TERMINATE_AT {
                let inner = self.buf[1..self.buf.len() - 1].to_vec();
                self.buf.clear();
                return Some(decode_frame(&inner));
            }
            return None;
        }

        self.buf.push(byte);
        None
    }

    /// Call periodically with the current time. If more than 2 s have
    /// passed since the last byte of an in-progress frame, discards it
    /// and reports the timeout.
    pub fn check_timeout(&mut self, now: Instant) -> Option<FrameError> {
        if self.buf.is_empty() {
            return None;
        }
        let idle = self
            .last_byte_at
            .map(|t| now.duration_since(t) >= ASSEMBLY_TIMEOUT)
            .unwrap_or(false);
        if idle {
            self.buf.clear();
            self.last_byte_at = None;
            Some(FrameError::Timeout)
        } else {
            None
        }
    }
}
