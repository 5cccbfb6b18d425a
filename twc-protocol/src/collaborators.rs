// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contracts for the two external collaborators the allocation policy
//! consults: a pulled power budget and a pushed vehicle start/stop API.
//!
//! Both are out of scope for this crate's own responsibilities; the
//! binary ships reference stand-ins behind these traits so it runs on
//! its own, but the traits live here because [`crate::allocation::AllocationPolicy`]'s
//! signature depends on them.

use crate::twcid::TWCID;

/// Supplies the amperage budget to divide among all slaves. May return
/// zero to stop every slave. Implementations are polled, not pushed to.
pub trait BudgetProvider {
    fn current_budget_amps(&self) -> f64;
}

/// A request to start or stop a vehicle's charge session, addressed by
/// the slave TWCID it's plugged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleApiRequest {
    StartCharge { twcid: TWCID },
    StopCharge { twcid: TWCID },
    /// At least one car is confirmed charging; clear the "don't keep
    /// asking to start" latch on every known vehicle, not just the one
    /// behind `twcid`, since we can't tell which vehicle is the one
    /// actually drawing current.
    ResetStartBackoff,
}

/// Accepts vehicle start/stop requests. Implementations must themselves
/// rate-limit to at most one request per vehicle per 60 s; the
/// allocation policy only decides *that* a request is warranted, not
/// whether it's safe to send right now.
pub trait VehicleApiClient {
    fn request(&self, request: VehicleApiRequest);
}
