// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two-byte TWC identifier and the one-byte "sign" that accompanies it
//! in several frame types.

use std::fmt;

/// Opaque 2-byte identifier for a TWC. All TWCs, master or slave, ship
/// with a random one; equality and hashing are by raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TWCID(pub [u8; 2]);

impl TWCID {
    /// The default master identifier used when none is configured.
    /// Chosen, like the original tool, to be easy to recognize in logs;
    /// there is a 1-in-65535 chance it collides with a real slave, in
    /// which case that slave will pick a new random id on its own.
    pub const DEFAULT_MASTER: TWCID = TWCID([0x77, 0x77]);

    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        TWCID(bytes)
    }

    pub const fn as_bytes(&self) -> [u8; 2] {
        self.0
    }
}

impl fmt::Display for TWCID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

/// One-byte tag accompanying a TWCID in link-ready and heartbeat frames.
/// The master's sign is a fixed configured value; a slave's sign is
/// observed and echoed back in logs, never used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sign(pub u8);

impl Sign {
    /// Matches the original tool's hard-coded choice: easy to spot in a
    /// hex dump, otherwise arbitrary.
    pub const DEFAULT_MASTER: Sign = Sign(0x77);
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}
