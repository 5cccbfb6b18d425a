// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-ready advertisement, slave discovery, heartbeat cadence, and
//! liveness tracking.
//!
//! [`ProtocolStateMachine`] owns the [`SlaveRegistry`] and the startup
//! counter/timers; it exposes `on_tick`/`on_frame` so the binary's main
//! loop, which owns the actual serial handle and clock, stays a thin
//! driver. This mirrors the pack's `ServerImpl` shape (`task/host-sp-comms`)
//! of a state-owning struct driven by a loop that performs the real I/O,
//! generalized from Hubris's IPC dispatch to a plain function-call API.

use std::time::{Duration, Instant};

use crate::error::ConfigError;
use crate::message::{Message, ProtocolVersion};
use crate::registry::{SlaveRecord, SlaveRegistry};
use crate::twcid::{Sign, TWCID};

/// Number of link-ready messages sent at startup (and again after a
/// TWCID collision): 5 of link-ready-1 followed by 5 of link-ready-2.
const INIT_MSGS_TOTAL: u32 = 10;
const INIT_MSGS_LINK_READY1_THRESHOLD: u32 = 5;

/// Minimum gap between heartbeat passes over the known slaves.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// What the main loop should transmit this tick, if anything.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    /// Nothing to send yet (heartbeat interval hasn't elapsed, or there
    /// are no live slaves to heartbeat).
    Idle,
    SendLinkReady1,
    SendLinkReady2,
    /// Send a master heartbeat to every slave in this list, one after
    /// another; the caller is expected to pace sends per its own
    /// post-transmit settle delay.
    SendHeartbeats(Vec<TWCID>),
}

/// What happened as a result of a received frame, for the caller to log
/// or act on. `Registered`/`HeartbeatUpdated` carry enough for the
/// caller to then run the allocation policy and queue a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    /// A brand-new slave was admitted to the registry.
    SlaveRegistered { twcid: TWCID, downrated: Option<ConfigError> },
    /// An existing slave's heartbeat fields were updated.
    SlaveHeartbeatUpdated { twcid: TWCID },
    /// A slave link-ready collided with our own TWCID; the startup
    /// burst has been re-armed and no record was created.
    TwcidCollision,
    /// Another device is transmitting link-ready frames as a master.
    MasterCollisionDetected { opcode: [u8; 2], sender: [u8; 2] },
    /// Frame parsed cleanly but carried no actionable state change
    /// (e.g. a kWh report, or an opcode we merely log).
    Noted,
    /// Frame was dropped per the parsing rules (wrong receiver, unknown
    /// opcode at the frame layer, etc).
    Ignored,
}

/// Link-ready/heartbeat cadence, slave discovery, and liveness tracking.
/// Carries no serial I/O of its own.
#[derive(Debug)]
pub struct ProtocolStateMachine {
    master: TWCID,
    sign: Sign,
    wiring_max_amps_per_twc: f64,

    init_msgs_to_send: u32,
    time_last_tx: Option<Instant>,
    registry: SlaveRegistry,
}

impl ProtocolStateMachine {
    pub fn new(master: TWCID, sign: Sign, wiring_max_amps_per_twc: f64) -> Self {
        Self {
            master,
            sign,
            wiring_max_amps_per_twc,
            init_msgs_to_send: INIT_MSGS_TOTAL,
            time_last_tx: None,
            registry: SlaveRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SlaveRegistry {
        &mut self.registry
    }

    pub fn master_twcid(&self) -> TWCID {
        self.master
    }

    pub fn sign(&self) -> Sign {
        self.sign
    }

    /// True while we're still in the startup (or post-collision) burst.
    pub fn is_in_startup_burst(&self) -> bool {
        self.init_msgs_to_send > 0
    }

    /// Call once per 25 ms scheduling tick. Returns what to transmit, if
    /// anything; the caller must call [`Self::record_tx`] after actually
    /// writing bytes so pacing stays accurate, and should evict stale
    /// slaves via [`SlaveRegistry::evict_stale`] around the same time.
    pub fn on_tick(&mut self, now: Instant) -> TickAction {
        if self.init_msgs_to_send > INIT_MSGS_LINK_READY1_THRESHOLD {
            self.init_msgs_to_send -= 1;
            return TickAction::SendLinkReady1;
        }
        if self.init_msgs_to_send > 0 {
            self.init_msgs_to_send -= 1;
            return TickAction::SendLinkReady2;
        }

        let elapsed_since_tx = self
            .time_last_tx
            .map(|t| now.duration_since(t))
            .unwrap_or(HEARTBEAT_INTERVAL);
        if elapsed_since_tx < HEARTBEAT_INTERVAL {
            return TickAction::Idle;
        }

        let evicted = self.registry.evict_stale(now);
        for twcid in evicted {
            tracing::info!(%twcid, "slave evicted after 26s of silence");
        }

        let live: Vec<TWCID> = self.registry.iter().map(|s| s.twcid).collect();
        if live.is_empty() {
            TickAction::Idle
        } else {
            TickAction::SendHeartbeats(live)
        }
    }

    /// Records that a transmission just completed, so [`Self::on_tick`]'s
    /// 1 s heartbeat gate measures from the real wall clock.
    pub fn record_tx(&mut self, now: Instant) {
        self.time_last_tx = Some(now);
    }

    /// Dispatches one parsed, checksum-valid message. `payload_len` is the
    /// decoded payload's raw length (before the checksum byte was
    /// stripped), needed to infer protocol version on a slave link-ready
    /// (14 bytes => V1, 16 bytes => V2) — information the opcode parser
    /// itself discards once it has the fixed fields it needs.
    pub fn on_frame(&mut self, now: Instant, message: Message, payload_len: usize) -> FrameAction {
        match message {
            Message::SlaveLinkReady { sender, sign, max_amps } => {
                if sender == self.master {
                    // A slave rolled an id that collides with ours; force
                    // it to re-roll by re-entering the startup burst.
                    self.init_msgs_to_send = INIT_MSGS_TOTAL;
                    return FrameAction::TwcidCollision;
                }
                let version = if payload_len >= 16 {
                    ProtocolVersion::V2
                } else {
                    ProtocolVersion::V1
                };
                self.register_slave(sender, sign, version, max_amps, now)
            }
            Message::SlaveHeartbeat {
                sender,
                state,
                reported_amps_max,
                reported_amps_actual,
                ..
            } => {
                if let Some(slave) = self.registry.get_mut(sender) {
                    slave.apply_heartbeat(state, reported_amps_max, reported_amps_actual, now);
                    FrameAction::SlaveHeartbeatUpdated { twcid: sender }
                } else {
                    // A real master would already have a record for any
                    // slave heartbeating it; this is either corruption
                    // or a slave we missed the link-ready for.
                    FrameAction::Ignored
                }
            }
            Message::MasterCollision { opcode, sender } => {
                FrameAction::MasterCollisionDetected { opcode, sender }
            }
            Message::KwhVoltageReport { sender, total_kwh, phase_voltages } => {
                if let Some(slave) = self.registry.get_mut(sender) {
                    slave.last_kwh_and_voltage = Some((total_kwh, phase_voltages));
                }
                FrameAction::Noted
            }
            Message::LinkReady1 { .. } | Message::LinkReady2 { .. } | Message::Unknown { .. } => {
                FrameAction::Noted
            }
            Message::MasterHeartbeat { .. } => {
                // We only ever originate these; seeing one addressed
                // elsewhere on a half-duplex bus is just our own echo
                // or another master's (covered by `MasterCollision`
                // parsing upstream), nothing to act on here.
                FrameAction::Noted
            }
        }
    }

    /// Registers a slave explicitly, given the protocol version the
    /// caller determined from the raw frame length (14 => V1, 16 => V2)
    /// before this crate's opcode parser discarded that information.
    ///
    /// `wiring_max_amps_cfg` overrides the state machine's configured
    /// default when the caller has a per-TWC value (otherwise pass
    /// `None` to use [`Self::wiring_max_amps_per_twc`]).
    pub fn register_slave(
        &mut self,
        sender: TWCID,
        sign: Sign,
        version: ProtocolVersion,
        max_amps_rating: f64,
        now: Instant,
    ) -> FrameAction {
        let (record, downrated) = SlaveRecord::new(
            sender,
            sign,
            version,
            max_amps_rating,
            self.wiring_max_amps_per_twc,
            now,
        );
        if let Some(err) = &downrated {
            tracing::warn!(%sender, %err, "down-rating slave: configured wiring ceiling exceeds its rating");
        }
        self.registry.insert(record);
        FrameAction::SlaveRegistered { twcid: sender, downrated }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: TWCID = TWCID([0x77, 0x77]);

    #[test]
    fn startup_burst_sends_five_of_each_link_ready() {
        let mut sm = ProtocolStateMachine::new(MASTER, Sign(0x77), 40.0);
        let now = Instant::now();
        let mut lr1 = 0;
        let mut lr2 = 0;
        for _ in 0..10 {
            match sm.on_tick(now) {
                TickAction::SendLinkReady1 => lr1 += 1,
                TickAction::SendLinkReady2 => lr2 += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(lr1, 5);
        assert_eq!(lr2, 5);
        assert!(!sm.is_in_startup_burst());
    }

    #[test]
    fn heartbeat_gated_on_one_second_since_last_tx() {
        let mut sm = ProtocolStateMachine::new(MASTER, Sign(0x77), 40.0);
        let now = Instant::now();
        for _ in 0..10 {
            sm.on_tick(now);
        }
        sm.register_slave(TWCID([1, 2]), Sign(1), ProtocolVersion::V2, 40.0, now);
        sm.record_tx(now);

        assert_eq!(sm.on_tick(now + Duration::from_millis(200)), TickAction::Idle);
        match sm.on_tick(now + Duration::from_secs(2)) {
            TickAction::SendHeartbeats(ids) => assert_eq!(ids, vec![TWCID([1, 2])]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slave_collision_rearms_startup_burst() {
        let mut sm = ProtocolStateMachine::new(MASTER, Sign(0x77), 40.0);
        let now = Instant::now();
        for _ in 0..10 {
            sm.on_tick(now);
        }
        assert!(!sm.is_in_startup_burst());

        let action = sm.on_frame(
            now,
            Message::SlaveLinkReady { sender: MASTER, sign: Sign(0x11), max_amps: 40.0 },
            16,
        );
        assert_eq!(action, FrameAction::TwcidCollision);
        assert!(sm.is_in_startup_burst());
        assert!(!sm.registry.contains(MASTER));
    }

    #[test]
    fn unknown_slave_heartbeat_is_ignored() {
        let mut sm = ProtocolStateMachine::new(MASTER, Sign(0x77), 40.0);
        let now = Instant::now();
        let action = sm.on_frame(
            now,
            Message::SlaveHeartbeat {
                sender: TWCID([9, 9]),
                receiver: MASTER,
                state: 1,
                reported_amps_max: 10.0,
                reported_amps_actual: 5.0,
                tail: vec![],
            },
            9,
        );
        assert_eq!(action, FrameAction::Ignored);
    }

    #[test]
    fn master_collision_is_reported() {
        let mut sm = ProtocolStateMachine::new(MASTER, Sign(0x77), 40.0);
        let action = sm.on_frame(
            Instant::now(),
            Message::MasterCollision { opcode: [0xFC, 0xE1], sender: [0x99, 0x99] },
            14,
        );
        assert!(matches!(action, FrameAction::MasterCollisionDetected { .. }));
    }
}
