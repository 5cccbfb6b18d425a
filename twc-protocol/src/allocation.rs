// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computes the current limit to offer a slave on each of its
//! heartbeats, from the shared budget, the slave's own history, and
//! everyone else's current draw.
//!
//! `AllocationPolicy::decide` is a pure function: no I/O, no lock
//! acquisition of its own. The caller holds the budget lock for its
//! duration, per the concurrency model's "held-lock duration bounded to
//! O(number of slaves)" rule.

use std::time::{Duration, Instant};

use crate::collaborators::VehicleApiRequest;
use crate::message::{MasterHeartbeatCommand, ProtocolVersion};
use crate::registry::SlaveRecord;

const STOP_START_HYSTERESIS: Duration = Duration::from_secs(60);
const SIGNIFICANT_CHANGE_HYSTERESIS: Duration = Duration::from_secs(60);
const SPIKE_STUCK_WINDOW: Duration = Duration::from_secs(10);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5);

/// A consistent read of the shared budget state, taken under the
/// caller's lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    /// Amperage to divide among all slaves, before the wiring clamp.
    pub max_amps_to_divide: f64,
    /// Aggregate wiring ceiling across the whole bus.
    pub wiring_max_amps_all_twcs: f64,
}

/// Result of one allocation decision: the heartbeat to send this slave,
/// plus any vehicle-API requests the caller should forward.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationOutcome {
    pub command: MasterHeartbeatCommand,
    pub amps: f64,
    pub vehicle_api_requests: Vec<VehicleApiRequest>,
}

#[derive(Debug, Default)]
pub struct AllocationPolicy;

impl AllocationPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Decides the current limit for `slave`, given every other known
    /// slave's last-reported draw, and mutates `slave`'s offer-tracking
    /// fields in place.
    pub fn decide(
        &self,
        slave: &mut SlaveRecord,
        other_slaves: &[SlaveRecord],
        budget: BudgetSnapshot,
        min_amps_per_twc: f64,
        now: Instant,
    ) -> AllocationOutcome {
        // Step 1: clamp budget to the aggregate wiring ceiling.
        let mut budget_amps = budget.max_amps_to_divide;
        if budget_amps > budget.wiring_max_amps_all_twcs {
            tracing::warn!(
                budget_amps,
                ceiling = budget.wiring_max_amps_all_twcs,
                "budget exceeds aggregate wiring ceiling, clamping"
            );
            budget_amps = budget.wiring_max_amps_all_twcs;
        }

        // Step 2: count cars charging (>= 1.0 A actual). Self counts
        // unconditionally (even if this slave's own draw is under 1 A);
        // only other slaves are filtered by their actual draw.
        let num_cars_charging = (1
            + other_slaves
                .iter()
                .filter(|s| s.reported_amps_actual >= 1.0)
                .count()) as f64;
        let fair_share = (budget_amps / num_cars_charging).floor();

        // Step 3: reserve everyone else's current draw.
        let sum_others_actual: f64 = other_slaves.iter().map(|s| s.reported_amps_actual).sum();
        let mut desired = budget_amps - sum_others_actual;

        // Step 4: cap by fair share.
        desired = desired.min(fair_share);

        // Step 5: minimum-amps rule.
        let min_to_offer = min_amps_per_twc.max(slave.min_amps_supported);
        if desired < min_to_offer {
            if budget_amps / num_cars_charging > min_to_offer {
                desired = slave.min_amps_supported;
            } else {
                desired = 0.0;
            }
        } else {
            desired = desired.floor();
        }

        // Step 6: stop-charge hysteresis.
        if desired == 0.0
            && slave.last_amps_offered > 0.0
            && (now.duration_since(slave.last_amps_offered_changed_at) < STOP_START_HYSTERESIS
                || now.duration_since(slave.significant_change_at) < SIGNIFICANT_CHANGE_HYSTERESIS
                || slave.reported_amps_actual < 4.0)
        {
            desired = min_to_offer;
        }

        // Step 7: start-charge hysteresis.
        if slave.last_amps_offered == 0.0
            && desired > 0.0
            && now.duration_since(slave.last_amps_offered_changed_at) < STOP_START_HYSTERESIS
        {
            desired = slave.last_amps_offered;
        }

        // Step 8: "6 A stuck" spike workaround.
        let spike = slave.spike_amps_to_cancel_6a_limit;
        let wants_increase = desired < spike && desired > slave.last_amps_offered;
        let stuck_below_offer = slave.reported_amps_actual > 2.0
            && slave.reported_amps_actual <= spike
            && (slave.last_amps_offered - slave.reported_amps_actual) > 2.0
            && now.duration_since(slave.significant_change_at) > SPIKE_STUCK_WINDOW;
        if wants_increase || stuck_below_offer {
            if slave.last_amps_offered == spike
                && now.duration_since(slave.last_amps_offered_changed_at) > SPIKE_STUCK_WINDOW
            {
                desired = spike - 2.0;
            } else if now.duration_since(slave.last_amps_offered_changed_at) > RATE_LIMIT_WINDOW {
                desired = spike;
            } else {
                desired = slave.last_amps_offered;
            }
        }

        // Step 9: rate-limit decreases.
        if desired < slave.last_amps_offered
            && now.duration_since(slave.last_amps_offered_changed_at) < RATE_LIMIT_WINDOW
        {
            desired = slave.last_amps_offered;
        }

        // Step 10: final safety clamp.
        if sum_others_actual + desired > budget.wiring_max_amps_all_twcs {
            desired = (budget.wiring_max_amps_all_twcs - sum_others_actual).max(slave.min_amps_supported);
        }
        if desired > slave.wiring_max_amps {
            desired = slave.wiring_max_amps;
        }
        if desired != slave.last_amps_offered {
            slave.last_amps_offered_changed_at = now;
        }
        slave.last_amps_offered = desired;

        // Step 11: emit the heartbeat command.
        let command = if slave.reported_amps_max == desired && desired != 0.0 {
            MasterHeartbeatCommand::NoChange
        } else if slave.protocol_version == ProtocolVersion::V2 {
            MasterHeartbeatCommand::SetCurrentV2
        } else {
            MasterHeartbeatCommand::SetCurrent
        };

        let mut vehicle_api_requests = Vec::new();
        if slave.protocol_version == ProtocolVersion::V2 {
            if slave.last_amps_offered == 0.0 && slave.reported_amps_actual > 4.0 {
                vehicle_api_requests.push(VehicleApiRequest::StopCharge { twcid: slave.twcid });
            } else if slave.last_amps_offered >= 5.0
                && slave.reported_amps_actual < 2.0
                && slave.reported_state != 0x02
            {
                vehicle_api_requests.push(VehicleApiRequest::StartCharge { twcid: slave.twcid });
            } else if slave.reported_amps_actual > 4.0 {
                vehicle_api_requests.push(VehicleApiRequest::ResetStartBackoff);
            }
        }

        AllocationOutcome {
            command,
            amps: desired,
            vehicle_api_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twcid::{Sign, TWCID};

    fn new_slave(now: Instant, rating: f64, wiring: f64, version: ProtocolVersion) -> SlaveRecord {
        let (record, _) = SlaveRecord::new(TWCID([1, 1]), Sign(0x11), version, rating, wiring, now);
        record
    }

    #[test]
    fn offers_fair_share_when_budget_plentiful() {
        let now = Instant::now();
        let mut slave = new_slave(now, 40.0, 40.0, ProtocolVersion::V2);
        slave.apply_heartbeat(0x03, 0.0, 0.0, now);

        let outcome = AllocationPolicy::new().decide(
            &mut slave,
            &[],
            BudgetSnapshot {
                max_amps_to_divide: 30.0,
                wiring_max_amps_all_twcs: 40.0,
            },
            6.0,
            now,
        );
        assert_eq!(outcome.amps, 30.0);
    }

    #[test]
    fn stop_charge_hysteresis_holds_minimum_for_60s() {
        let now = Instant::now();
        let mut slave = new_slave(now, 40.0, 40.0, ProtocolVersion::V1);
        slave.apply_heartbeat(0x01, 12.0, 10.0, now);
        slave.last_amps_offered = 12.0;
        slave.last_amps_offered_changed_at = now;

        let outcome = AllocationPolicy::new().decide(
            &mut slave,
            &[],
            BudgetSnapshot {
                max_amps_to_divide: 0.0,
                wiring_max_amps_all_twcs: 40.0,
            },
            6.0,
            now + Duration::from_secs(5),
        );
        // Budget collapsed to 0 but hysteresis keeps the slave above 0
        // until 60s have passed.
        assert!(outcome.amps > 0.0);
    }

    #[test]
    fn spike_workaround_offers_spike_once_settled() {
        let now = Instant::now();
        let mut slave = new_slave(now, 40.0, 40.0, ProtocolVersion::V2);
        slave.apply_heartbeat(0x01, 6.0, 6.0, now);
        slave.last_amps_offered = 6.0;
        slave.last_amps_offered_changed_at = now - Duration::from_secs(6);

        let outcome = AllocationPolicy::new().decide(
            &mut slave,
            &[],
            BudgetSnapshot {
                max_amps_to_divide: 10.0,
                wiring_max_amps_all_twcs: 40.0,
            },
            6.0,
            now,
        );
        assert_eq!(outcome.amps, 16.0);
    }

    #[test]
    fn v2_requests_stop_charge_when_offer_drops_to_zero_but_car_still_drawing() {
        let now = Instant::now();
        let mut slave = new_slave(now, 40.0, 40.0, ProtocolVersion::V2);
        slave.apply_heartbeat(0x01, 0.0, 6.0, now);
        slave.last_amps_offered = 0.0;
        slave.last_amps_offered_changed_at = now - Duration::from_secs(120);
        slave.significant_change_at = now - Duration::from_secs(120);

        let outcome = AllocationPolicy::new().decide(
            &mut slave,
            &[],
            BudgetSnapshot {
                max_amps_to_divide: 0.0,
                wiring_max_amps_all_twcs: 40.0,
            },
            6.0,
            now,
        );
        assert!(outcome
            .vehicle_api_requests
            .contains(&VehicleApiRequest::StopCharge { twcid: slave.twcid }));
    }

    #[test]
    fn num_cars_charging_counts_self_even_when_not_yet_drawing() {
        // Self is at 0.5A (not yet "charging" by the >= 1.0A test) while
        // one other slave draws 1A. num_cars_charging must still be 2
        // (self counts unconditionally), so fair_share = 20/2 = 10. If
        // self were excluded, fair_share would wrongly be 20/1 = 20 and
        // this not-yet-drawing slave would be offered double its share.
        let now = Instant::now();
        let mut slave = new_slave(now, 40.0, 40.0, ProtocolVersion::V2);
        slave.apply_heartbeat(0x01, 0.0, 0.5, now);
        // A prior offer already above the correct fair share, far enough
        // in the past that the start/stop hysteresis and rate-limit
        // steps don't interfere; only the fair-share cap should move it.
        slave.last_amps_offered = 19.0;
        slave.last_amps_offered_changed_at = now - Duration::from_secs(120);

        let (mut other, _) =
            SlaveRecord::new(TWCID([2, 2]), Sign(0x22), ProtocolVersion::V2, 40.0, 40.0, now);
        other.apply_heartbeat(0x01, 1.0, 1.0, now);

        let outcome = AllocationPolicy::new().decide(
            &mut slave,
            &[other],
            BudgetSnapshot {
                max_amps_to_divide: 20.0,
                wiring_max_amps_all_twcs: 40.0,
            },
            6.0,
            now,
        );
        assert_eq!(outcome.amps, 10.0);
    }
}
