// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-slave bookkeeping: the record kept for each discovered TWCID and
//! the insertion-ordered registry of all of them.
//!
//! Backed by an [`IndexMap`] — insertion order preserved, O(1) lookup —
//! the same "ordered map with fast lookup" shape the pack's `xtask`
//! config loader uses for its task table, chosen over a `BTreeMap`/`Vec`
//! pair so there's one structure to keep in sync instead of two.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::error::ConfigError;
use crate::message::ProtocolVersion;
use crate::twcid::{Sign, TWCID};

/// A slave is considered disconnected after this much silence.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(26);

/// Initial "6 A stuck" spike value, (re)applied on every slave
/// link-ready.
pub const DEFAULT_SPIKE_AMPS: f64 = 16.0;

/// Everything tracked about one discovered slave TWC.
#[derive(Debug, Clone)]
pub struct SlaveRecord {
    pub twcid: TWCID,
    pub sign: Sign,
    pub protocol_version: ProtocolVersion,

    /// Ceiling the slave self-reports in its link-ready frame.
    pub max_amps_rating: f64,
    /// Per-TWC wiring ceiling, clamped to `max_amps_rating` at
    /// registration time.
    pub wiring_max_amps: f64,
    /// 5 for V1, 6 for V2.
    pub min_amps_supported: f64,

    /// Last observed slave heartbeat fields.
    pub reported_state: u8,
    pub reported_amps_max: f64,
    pub reported_amps_actual: f64,

    /// Amperage currently authorized to this slave. -1 until first set.
    pub last_amps_offered: f64,
    pub last_amps_offered_changed_at: Instant,
    /// Sentinel tracking the last `reported_amps_actual` that differed
    /// from the previous one by >= 0.8 A; drives `significant_change_at`.
    pub significant_change_monitor: f64,
    pub significant_change_at: Instant,
    pub last_rx_at: Instant,

    /// Per-slave "6 A stuck" spike value (see the allocation policy's
    /// step 8); reset to [`DEFAULT_SPIKE_AMPS`] on every link-ready.
    pub spike_amps_to_cancel_6a_limit: f64,
    /// Last-seen kWh/voltage report, informational only.
    pub last_kwh_and_voltage: Option<(u32, Vec<u16>)>,
}

impl SlaveRecord {
    /// Builds a fresh record from a slave's link-ready frame.
    ///
    /// `wiring_max_amps_cfg` is the operator's configured per-TWC
    /// ceiling; if it exceeds the slave's self-reported rating the
    /// record is down-rated to `rating / 4` and the caller is told so
    /// it can raise a danger warning.
    pub fn new(
        twcid: TWCID,
        sign: Sign,
        protocol_version: ProtocolVersion,
        max_amps_rating: f64,
        wiring_max_amps_cfg: f64,
        now: Instant,
    ) -> (Self, Option<ConfigError>) {
        let (wiring_max_amps, downrate) = if wiring_max_amps_cfg > max_amps_rating {
            (
                max_amps_rating / 4.0,
                Some(ConfigError::ConfiguredRatingExceedsSlave {
                    configured: wiring_max_amps_cfg,
                    rating: max_amps_rating,
                }),
            )
        } else {
            (wiring_max_amps_cfg, None)
        };

        let record = SlaveRecord {
            twcid,
            sign,
            protocol_version,
            max_amps_rating,
            wiring_max_amps,
            min_amps_supported: protocol_version.min_amps_supported(),
            reported_state: 0,
            reported_amps_max: 0.0,
            reported_amps_actual: 0.0,
            last_amps_offered: -1.0,
            last_amps_offered_changed_at: now,
            significant_change_monitor: -1.0,
            significant_change_at: now,
            last_rx_at: now,
            spike_amps_to_cancel_6a_limit: DEFAULT_SPIKE_AMPS,
            last_kwh_and_voltage: None,
        };
        (record, downrate)
    }

    /// Applies a freshly parsed slave heartbeat, updating the
    /// significant-change sentinel and its timestamp when
    /// `reported_amps_actual` moves by at least 0.8 A.
    pub fn apply_heartbeat(
        &mut self,
        state: u8,
        reported_amps_max: f64,
        reported_amps_actual: f64,
        now: Instant,
    ) {
        self.reported_state = state;
        self.reported_amps_max = reported_amps_max;
        if self.significant_change_monitor < 0.0
            || (reported_amps_actual - self.significant_change_monitor).abs() >= 0.8
        {
            self.significant_change_monitor = reported_amps_actual;
            self.significant_change_at = now;
        }
        self.reported_amps_actual = reported_amps_actual;
        self.last_rx_at = now;

        if self.last_amps_offered < 0.0 {
            // First heartbeat since registration: adopt the slave's own
            // reported max as our starting offer.
            self.last_amps_offered = reported_amps_max;
            self.last_amps_offered_changed_at = now;
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_rx_at) >= LIVENESS_TIMEOUT
    }
}

/// All known slaves, keyed by TWCID, in discovery order.
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slaves: IndexMap<TWCID, SlaveRecord>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: SlaveRecord) {
        self.slaves.insert(record.twcid, record);
    }

    pub fn get(&self, twcid: TWCID) -> Option<&SlaveRecord> {
        self.slaves.get(&twcid)
    }

    pub fn get_mut(&mut self, twcid: TWCID) -> Option<&mut SlaveRecord> {
        self.slaves.get_mut(&twcid)
    }

    pub fn contains(&self, twcid: TWCID) -> bool {
        self.slaves.contains_key(&twcid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlaveRecord> {
        self.slaves.values()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    /// Removes every slave whose `last_rx_at` is past [`LIVENESS_TIMEOUT`]
    /// and returns their ids, so the caller can log the eviction.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<TWCID> {
        let stale: Vec<TWCID> = self
            .slaves
            .values()
            .filter(|s| s.is_stale(now))
            .map(|s| s.twcid)
            .collect();
        for twcid in &stale {
            self.slaves.shift_remove(twcid);
        }
        stale
    }
}
