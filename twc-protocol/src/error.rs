// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed errors for the framing, parsing, and configuration layers.
//!
//! These mirror the shape of `host-sp-messages`'s `DecodeFailureReason`:
//! a plain enum with a hand-written [`std::error::Error`] impl, one
//! variant per distinct failure the wire format can produce.

use std::fmt;

/// A frame failed to decode off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// A `0xDB` escape byte was followed by something other than
    /// `0xDC`/`0xDD`. The two bytes were folded into a bare `0xDB` and
    /// decoding continued; this is reported so the caller can count it.
    BadEscape,
    /// The checksum byte did not match the computed checksum.
    ChecksumMismatch { expected: u8, found: u8 },
    /// The decoded payload length was not 14, 16, or 20 bytes.
    BadLength(usize),
    /// More than 2 seconds elapsed mid-frame with no new bytes.
    Timeout,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadEscape => write!(f, "invalid escape sequence in frame"),
            FrameError::ChecksumMismatch { expected, found } => write!(
                f,
                "checksum mismatch: expected {expected:02X}, found {found:02X}"
            ),
            FrameError::BadLength(n) => write!(f, "unexpected payload length {n}"),
            FrameError::Timeout => write!(f, "frame assembly timed out"),
        }
    }
}

impl std::error::Error for FrameError {}

/// A well-framed, checksum-valid payload did not parse into a known
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Payload was too short to contain even an opcode.
    Empty,
    /// Opcode was recognized but the receiver-id field didn't match our
    /// master TWCID (and wasn't zero, a known corruption mode).
    WrongReceiver { expected: [u8; 2], found: [u8; 2] },
    /// Opcode byte pair is not one this core recognizes.
    UnknownOpcode([u8; 2]),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty payload"),
            ParseError::WrongReceiver { expected, found } => write!(
                f,
                "heartbeat addressed to {found:02X?}, expected {expected:02X?}"
            ),
            ParseError::UnknownOpcode(op) => write!(f, "unknown opcode {op:02X?}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Configuration is internally inconsistent or exceeds hardware limits.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `wiring_max_amps_per_twc` exceeds `wiring_max_amps_all_twcs`.
    PerTwcExceedsAggregate { per_twc: f64, aggregate: f64 },
    /// A configured per-TWC ceiling exceeds the slave's self-reported
    /// rating; the record is down-rated to `rating / 4` and this is
    /// raised as a danger warning, not a fatal error.
    ConfiguredRatingExceedsSlave { configured: f64, rating: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::PerTwcExceedsAggregate { per_twc, aggregate } => write!(
                f,
                "wiring_max_amps_per_twc ({per_twc}) exceeds wiring_max_amps_all_twcs ({aggregate})"
            ),
            ConfigError::ConfiguredRatingExceedsSlave { configured, rating } => write!(
                f,
                "configured wiring ceiling ({configured}) exceeds slave's rating ({rating}); down-rating to rating/4"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
