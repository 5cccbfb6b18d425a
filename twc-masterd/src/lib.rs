// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary-side plumbing around `twc-protocol`: configuration, the serial
//! transport, reference collaborators, and the main loop that ties them
//! together. Split into a library so integration tests can drive
//! [`daemon::Daemon`] against [`serial::FakeSerialPort`] without a real
//! character device.

pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod serial;
