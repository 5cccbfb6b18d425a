// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reference stand-ins for the budget provider and vehicle-API client,
//! the two collaborators the core's allocation policy consults but
//! doesn't itself implement. A real deployment swaps these for a
//! solar/schedule-aware budget source and a real vehicle API client
//! without touching `twc-protocol`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use twc_protocol::{BudgetProvider, VehicleApiClient, VehicleApiRequest, TWCID};

/// Returns a constant amperage from config. Logs a warning at
/// construction if that amperage is zero, since that stops every slave.
pub struct FixedBudgetProvider {
    amps: f64,
}

impl FixedBudgetProvider {
    pub fn new(amps: f64) -> Self {
        if amps == 0.0 {
            tracing::warn!("fixed budget is 0A; all slaves will be held at minimum or stopped");
        }
        Self { amps }
    }
}

impl BudgetProvider for FixedBudgetProvider {
    fn current_budget_amps(&self) -> f64 {
        self.amps
    }
}

/// Logs start/stop requests at `info` level instead of calling a real
/// vehicle API, internally rate-limited to one request per vehicle per
/// 60s as the collaborator contract requires.
pub struct NullVehicleApiClient {
    last_request_at: Mutex<HashMap<TWCID, Instant>>,
}

impl Default for NullVehicleApiClient {
    fn default() -> Self {
        Self { last_request_at: Mutex::new(HashMap::new()) }
    }
}

impl NullVehicleApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn rate_limited(&self, twcid: TWCID, now: Instant) -> bool {
        let mut last = self.last_request_at.lock().unwrap();
        match last.get(&twcid) {
            Some(prev) if now.duration_since(*prev) < Duration::from_secs(60) => true,
            _ => {
                last.insert(twcid, now);
                false
            }
        }
    }
}

impl VehicleApiClient for NullVehicleApiClient {
    fn request(&self, request: VehicleApiRequest) {
        let now = Instant::now();
        match request {
            VehicleApiRequest::StartCharge { twcid } => {
                if self.rate_limited(twcid, now) {
                    tracing::debug!(%twcid, "suppressing start-charge request, rate-limited");
                } else {
                    tracing::info!(%twcid, "vehicle API: start charge (no-op stand-in)");
                }
            }
            VehicleApiRequest::StopCharge { twcid } => {
                if self.rate_limited(twcid, now) {
                    tracing::debug!(%twcid, "suppressing stop-charge request, rate-limited");
                } else {
                    tracing::info!(%twcid, "vehicle API: stop charge (no-op stand-in)");
                }
            }
            VehicleApiRequest::ResetStartBackoff => {
                tracing::trace!("clearing start-request backoff on all known vehicles");
                self.last_request_at.lock().unwrap().clear();
            }
        }
    }
}
