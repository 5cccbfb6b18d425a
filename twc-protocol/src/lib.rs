// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol core for impersonating a Tesla Wall Connector (TWC) master on
//! an RS-485 bus.
//!
//! This crate has no serial I/O of its own: it is a pure state machine and
//! set of codecs driven by a caller that owns the actual transport. See
//! [`frame`] for the SLIP-derived wire framing, [`message`] for the typed
//! opcode table, [`registry`] for the per-slave bookkeeping,
//! [`state_machine`] for link-ready/heartbeat cadence, and [`allocation`]
//! for the current-allocation policy.

pub mod allocation;
pub mod collaborators;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod state_machine;
pub mod twcid;

pub use allocation::{AllocationOutcome, AllocationPolicy, BudgetSnapshot};
pub use collaborators::{BudgetProvider, VehicleApiClient, VehicleApiRequest};
pub use error::{ConfigError, FrameError, ParseError};
pub use frame::{decode_frame, encode_frame};
pub use message::{parse_message, Message, MasterHeartbeatCommand, ProtocolVersion};
pub use registry::{SlaveRecord, SlaveRegistry};
pub use state_machine::{FrameAction, ProtocolStateMachine, TickAction};
pub use twcid::{Sign, TWCID};
