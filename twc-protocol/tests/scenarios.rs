// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios (S1-S6) driving the codec, message layer, state
//! machine, and allocation policy together through their public API, no
//! real serial port involved.

use std::time::{Duration, Instant};

use twc_protocol::{
    decode_frame, encode_frame, message, parse_message, AllocationPolicy, BudgetSnapshot,
    FrameAction, Message, ProtocolStateMachine, Sign, TickAction, TWCID,
};

const MASTER: TWCID = TWCID([0x77, 0x77]);
const MASTER_SIGN: Sign = Sign(0x77);

fn drive_startup_burst(sm: &mut ProtocolStateMachine, now: Instant) -> (usize, usize) {
    let mut lr1 = 0;
    let mut lr2 = 0;
    for _ in 0..10 {
        match sm.on_tick(now) {
            TickAction::SendLinkReady1 => lr1 += 1,
            TickAction::SendLinkReady2 => lr2 += 1,
            other => panic!("unexpected tick action during startup: {other:?}"),
        }
        sm.record_tx(now);
    }
    (lr1, lr2)
}

/// S1 - Startup burst: first 10 outbound frames are 5x link-ready-1 then
/// 5x link-ready-2, each framed and checksummed.
#[test]
fn s1_startup_burst_is_five_and_five() {
    let mut sm = ProtocolStateMachine::new(MASTER, MASTER_SIGN, 40.0);
    let now = Instant::now();
    let (lr1, lr2) = drive_startup_burst(&mut sm, now);
    assert_eq!((lr1, lr2), (5, 5));

    let payload = message::build_link_ready1(MASTER, MASTER_SIGN);
    assert_eq!(payload, vec![0xFC, 0xE1, 0x77, 0x77, 0x77, 0, 0, 0, 0, 0, 0, 0, 0]);
    let framed = encode_frame(&payload);
    assert_eq!(framed[0], 0xC0);
    assert_eq!(*framed.last().unwrap(), 0xC0);

    let inner = &framed[1..framed.len() - 1];
    let decoded = decode_frame(inner).unwrap();
    assert_eq!(decoded.len(), 13);
}

/// S2 - Slave discovery (V1): a slave link-ready frame registers a new
/// record with V1 semantics and the registry reflects the configured
/// wiring ceiling.
#[test]
fn s2_slave_discovery_v1() {
    let mut sm = ProtocolStateMachine::new(MASTER, MASTER_SIGN, 80.0);
    let now = Instant::now();
    drive_startup_burst(&mut sm, now);

    let payload = vec![0xFDu8, 0xE2, 0xAB, 0xCD, 0x55, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
    let framed = encode_frame(&payload);
    let inner = &framed[1..framed.len() - 1];
    let decoded = decode_frame(inner).unwrap();
    assert_eq!(decoded.len(), 13);

    let msg = parse_message(&decoded, MASTER).unwrap();
    let action = sm.on_frame(now, msg, decoded.len() + 1);
    assert_eq!(action, FrameAction::SlaveRegistered { twcid: TWCID([0xAB, 0xCD]), downrated: None });

    let slave = sm.registry().get(TWCID([0xAB, 0xCD])).unwrap();
    assert_eq!(slave.protocol_version, message::ProtocolVersion::V1);
    assert_eq!(slave.min_amps_supported, 5.0);
    assert!((slave.wiring_max_amps - 80.0).abs() < 0.01);

    // A tick after the one-second gate should now heartbeat this slave.
    match sm.on_tick(now + Duration::from_secs(2)) {
        TickAction::SendHeartbeats(ids) => assert_eq!(ids, vec![TWCID([0xAB, 0xCD])]),
        other => panic!("expected heartbeat, got {other:?}"),
    }
}

/// S3 - Heartbeat loop: a slave reporting state 04, max 19.00A, actual
/// 0A under a 20A budget is offered 20A with command SetCurrent.
#[test]
fn s3_heartbeat_offers_budget_when_ample() {
    let mut sm = ProtocolStateMachine::new(MASTER, MASTER_SIGN, 40.0);
    let now = Instant::now();
    sm.register_slave(TWCID([0xAB, 0xCD]), Sign(0x55), message::ProtocolVersion::V1, 40.0, now);

    let slave = sm.registry_mut().get_mut(TWCID([0xAB, 0xCD])).unwrap();
    slave.apply_heartbeat(0x04, 19.0, 0.0, now);

    let mut slave = sm.registry().get(TWCID([0xAB, 0xCD])).unwrap().clone();
    let outcome = AllocationPolicy::new().decide(
        &mut slave,
        &[],
        BudgetSnapshot { max_amps_to_divide: 20.0, wiring_max_amps_all_twcs: 40.0 },
        6.0,
        now,
    );
    assert_eq!(outcome.amps, 20.0);

    let heartbeat = message::build_master_heartbeat(
        MASTER,
        slave.twcid,
        slave.protocol_version,
        outcome.command,
        outcome.amps,
        false,
    );
    // bytes 6-7 (command byte's amps field) should read 07 D0 = 2000 = 20.00A
    assert_eq!(&heartbeat[6..9], &[0x05, 0x07, 0xD0]);
}

/// S4 - Stop-charge hysteresis: offering drops to min_to_offer, not 0,
/// until 60s have passed since the last change.
#[test]
fn s4_stop_charge_hysteresis_then_drops_to_zero() {
    let now = Instant::now();
    let (mut slave, _) = twc_protocol::SlaveRecord::new(
        TWCID([1, 1]),
        Sign(0x11),
        message::ProtocolVersion::V1,
        40.0,
        40.0,
        now,
    );
    slave.apply_heartbeat(0x01, 10.0, 10.0, now);
    slave.last_amps_offered = 10.0;
    slave.last_amps_offered_changed_at = now - Duration::from_secs(30);

    let policy = AllocationPolicy::new();
    let outcome = policy.decide(
        &mut slave,
        &[],
        BudgetSnapshot { max_amps_to_divide: 3.0, wiring_max_amps_all_twcs: 40.0 },
        6.0,
        now,
    );
    assert!(outcome.amps > 0.0, "hysteresis should hold a nonzero offer");

    // 60s later, still stuck at low actual draw: the hysteresis windows
    // (both time-based and the < 4.0A actual-draw condition) have all
    // cleared, so the offer can finally fall to zero.
    let later = now + Duration::from_secs(65);
    slave.reported_amps_actual = 10.0;
    let outcome2 = policy.decide(
        &mut slave,
        &[],
        BudgetSnapshot { max_amps_to_divide: 3.0, wiring_max_amps_all_twcs: 40.0 },
        6.0,
        later,
    );
    assert_eq!(outcome2.amps, 0.0);
}

/// S5 - Spike workaround: a car stuck at ~5.2A for 15s while offered
/// 12A gets bumped to the 16A spike, then settles back down.
#[test]
fn s5_spike_workaround_then_settles() {
    let now = Instant::now();
    let (mut slave, _) = twc_protocol::SlaveRecord::new(
        TWCID([2, 2]),
        Sign(0x22),
        message::ProtocolVersion::V2,
        40.0,
        40.0,
        now,
    );
    slave.apply_heartbeat(0x01, 12.0, 5.2, now);
    slave.last_amps_offered = 12.0;
    slave.last_amps_offered_changed_at = now - Duration::from_secs(20);
    slave.significant_change_at = now - Duration::from_secs(15);

    let policy = AllocationPolicy::new();
    let outcome = policy.decide(
        &mut slave,
        &[],
        BudgetSnapshot { max_amps_to_divide: 32.0, wiring_max_amps_all_twcs: 40.0 },
        6.0,
        now,
    );
    assert_eq!(outcome.amps, 16.0);

    // Dwell past the stuck window with the car still short: back off.
    let later = now + Duration::from_secs(11);
    let outcome2 = policy.decide(
        &mut slave,
        &[],
        BudgetSnapshot { max_amps_to_divide: 32.0, wiring_max_amps_all_twcs: 40.0 },
        6.0,
        later,
    );
    assert_eq!(outcome2.amps, 14.0);
}

/// S6 - Liveness eviction: 27s of silence evicts a slave exactly once;
/// a fresh link-ready re-admits it.
#[test]
fn s6_liveness_eviction_and_readmission() {
    let mut sm = ProtocolStateMachine::new(MASTER, MASTER_SIGN, 40.0);
    let now = Instant::now();
    drive_startup_burst(&mut sm, now);
    sm.register_slave(TWCID([0xAB, 0xCD]), Sign(0x55), message::ProtocolVersion::V1, 40.0, now);
    sm.record_tx(now);

    match sm.on_tick(now + Duration::from_secs(27)) {
        TickAction::Idle => {}
        other => panic!("expected no live slaves to heartbeat, got {other:?}"),
    }
    assert!(!sm.registry().contains(TWCID([0xAB, 0xCD])));

    let later = now + Duration::from_secs(28);
    let action = sm.on_frame(
        later,
        Message::SlaveLinkReady { sender: TWCID([0xAB, 0xCD]), sign: Sign(0x55), max_amps: 40.0 },
        14,
    );
    assert!(matches!(action, FrameAction::SlaveRegistered { .. }));
    sm.record_tx(later);
    match sm.on_tick(later + Duration::from_secs(2)) {
        TickAction::SendHeartbeats(ids) => assert_eq!(ids, vec![TWCID([0xAB, 0xCD])]),
        other => panic!("expected heartbeat resumption, got {other:?}"),
    }
}
