// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The main loop: drives `twc-protocol`'s state machine and allocation
//! policy over a [`SerialPort`], pulling the shared budget and pushing
//! vehicle-API requests to the background collaborators.
//!
//! `pending_master_heartbeat` from the data model (the 7/9-byte
//! heartbeat queued for a slave's next tick) is tracked here as a
//! `(command, amps)` pair per TWCID rather than a raw byte buffer: the
//! wire bytes are a pure function of those two values plus the slave's
//! protocol version, so keeping the decoded form avoids a second
//! representation of the same decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use twc_protocol::message::{build_link_ready1, build_link_ready2, build_master_heartbeat};
use twc_protocol::{
    encode_frame, parse_message, AllocationPolicy, BudgetProvider, BudgetSnapshot, FrameAction,
    FrameError, MasterHeartbeatCommand, ProtocolStateMachine, Sign, TickAction, VehicleApiClient,
    VehicleApiRequest, TWCID,
};

use crate::config::Config;

const IDLE_TICK: Duration = Duration::from_secs_f64(0.025);
const SETTLE_TICK: Duration = Duration::from_millis(100);

/// The budget state shared between the main loop and the background
/// budget-polling thread, guarded by a single lock per the concurrency
/// model.
#[derive(Debug, Clone, Copy)]
pub struct BudgetState {
    pub max_amps_to_divide: f64,
}

/// Bytewise access to the bus; see [`crate::serial`] for the real and
/// fake implementations.
pub use crate::serial::SerialPort;

/// Owns the protocol state machine and drives it against a serial
/// port, computing allocations and forwarding vehicle-API requests.
pub struct Daemon {
    master: TWCID,
    sign: Sign,
    config: Config,
    sm: ProtocolStateMachine,
    assembler: twc_protocol::frame::FrameAssembler,
    policy: AllocationPolicy,
    pending: HashMap<TWCID, (MasterHeartbeatCommand, f64)>,
    budget: Arc<Mutex<BudgetState>>,
    vehicle_tx: mpsc::Sender<VehicleApiRequest>,
}

impl Daemon {
    pub fn new(
        config: Config,
        budget: Arc<Mutex<BudgetState>>,
        vehicle_tx: mpsc::Sender<VehicleApiRequest>,
    ) -> Self {
        let master = config.master_twcid;
        let sign = config.master_sign;
        let sm = ProtocolStateMachine::new(master, sign, config.wiring_max_amps_per_twc);
        Self {
            master,
            sign,
            config,
            sm,
            assembler: twc_protocol::frame::FrameAssembler::new(),
            policy: AllocationPolicy::new(),
            pending: HashMap::new(),
            budget,
            vehicle_tx,
        }
    }

    /// Runs one 25ms scheduling tick: an outbound phase (link-ready
    /// burst or per-slave heartbeats) followed by draining whatever is
    /// available on the input. Returns the outbound action taken so the
    /// caller can pace its own sleep.
    pub fn tick_once<P: SerialPort>(&mut self, port: &mut P, now: Instant) -> Result<TickAction> {
        let action = self.sm.on_tick(now);
        match &action {
            TickAction::Idle => {}
            TickAction::SendLinkReady1 => {
                let result = self.send_link_ready(port, now, true);
                log_transient_write_failure(result);
            }
            TickAction::SendLinkReady2 => {
                let result = self.send_link_ready(port, now, false);
                log_transient_write_failure(result);
            }
            TickAction::SendHeartbeats(ids) => {
                for twcid in ids.clone() {
                    let result = self.send_heartbeat_to(port, now, twcid);
                    log_transient_write_failure(result);
                    self.drain_inbound(port, now)?;
                }
            }
        }
        self.drain_inbound(port, now)?;
        Ok(action)
    }

    /// Read-only access to discovered slaves, for logging and tests.
    pub fn registry(&self) -> &twc_protocol::SlaveRegistry {
        self.sm.registry()
    }

    fn send_link_ready<P: SerialPort>(&mut self, port: &mut P, now: Instant, is_lr1: bool) -> Result<()> {
        let payload = if is_lr1 {
            build_link_ready1(self.master, self.sign)
        } else {
            build_link_ready2(self.master, self.sign)
        };
        port.write_all(&encode_frame(&payload))?;
        self.sm.record_tx(now);
        Ok(())
    }

    fn send_heartbeat_to<P: SerialPort>(&mut self, port: &mut P, now: Instant, twcid: TWCID) -> Result<()> {
        let Some(slave) = self.sm.registry().get(twcid) else { return Ok(()) };
        let version = slave.protocol_version;
        let (command, amps) = self
            .pending
            .get(&twcid)
            .copied()
            .unwrap_or((MasterHeartbeatCommand::NoChange, slave.last_amps_offered.max(0.0)));
        let payload = build_master_heartbeat(self.master, twcid, version, command, amps, false);
        port.write_all(&encode_frame(&payload))?;
        self.sm.record_tx(now);
        Ok(())
    }

    fn drain_inbound<P: SerialPort>(&mut self, port: &mut P, now: Instant) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            let n = port.read_available(&mut buf)?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                if let Some(result) = self.assembler.push_byte(byte, now) {
                    self.handle_frame(result, now);
                }
            }
        }
        if let Some(err) = self.assembler.check_timeout(now) {
            tracing::debug!(%err, "frame assembly timed out, resetting");
        }
        Ok(())
    }

    fn handle_frame(&mut self, result: std::result::Result<Vec<u8>, FrameError>, now: Instant) {
        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(%err, "dropping corrupt frame");
                return;
            }
        };
        // `decode_frame` already stripped the checksum byte; the
        // payload length used for protocol-version inference is the
        // wire length including it.
        let payload_len_with_checksum = payload.len() + 1;
        let message = match parse_message(&payload, self.master) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%err, "dropping unparseable frame");
                return;
            }
        };
        match self.sm.on_frame(now, message, payload_len_with_checksum) {
            // The protocol layer already logs a warning on down-rate; just
            // note the new slave here.
            FrameAction::SlaveRegistered { twcid, .. } => {
                tracing::info!(%twcid, "slave registered");
            }
            FrameAction::SlaveHeartbeatUpdated { twcid } => self.run_allocation(twcid, now),
            FrameAction::TwcidCollision => {
                tracing::warn!("slave TWCID collided with ours, re-entering link-ready burst");
            }
            FrameAction::MasterCollisionDetected { opcode, sender } => {
                tracing::error!(?opcode, ?sender, "another device is transmitting as a TWC master on this bus");
            }
            FrameAction::Noted | FrameAction::Ignored => {}
        }
    }

    fn run_allocation(&mut self, twcid: TWCID, now: Instant) {
        let snapshot = {
            let budget = self.budget.lock().unwrap();
            BudgetSnapshot {
                max_amps_to_divide: budget.max_amps_to_divide,
                wiring_max_amps_all_twcs: self.config.wiring_max_amps_all_twcs,
            }
        };
        let others: Vec<_> = self
            .sm
            .registry()
            .iter()
            .filter(|s| s.twcid != twcid)
            .cloned()
            .collect();
        let Some(slave) = self.sm.registry_mut().get_mut(twcid) else { return };
        let outcome = self.policy.decide(slave, &others, snapshot, self.config.min_amps_per_twc, now);
        for request in outcome.vehicle_api_requests {
            let _ = self.vehicle_tx.send(request);
        }
        self.pending.insert(twcid, (outcome.command, outcome.amps));
    }
}

/// A write failure is transient per the core's error-handling design: log
/// it and let the next cadence tick retry, rather than tearing down the
/// whole daemon over one bad write.
fn log_transient_write_failure(result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(%err, "serial write failed, will retry next tick");
    }
}

/// Spawns the background thread that polls `provider` at `interval`
/// and publishes the result into `budget`, the single lock the main
/// loop also reads under in [`Daemon::run_allocation`].
pub fn spawn_budget_poller(
    budget: Arc<Mutex<BudgetState>>,
    provider: Arc<dyn BudgetProvider + Send + Sync>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let amps = provider.current_budget_amps();
            *budget.lock().unwrap() = BudgetState { max_amps_to_divide: amps };
            thread::sleep(interval);
        }
    })
}

/// Spawns the worker that forwards queued vehicle-API requests to
/// `client`, off the main loop's thread.
pub fn spawn_vehicle_api_worker(
    rx: mpsc::Receiver<VehicleApiRequest>,
    client: Arc<dyn VehicleApiClient + Send + Sync>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = rx.recv() {
            client.request(request);
        }
    })
}

/// Runs the daemon's main loop until `shutdown` is set, ticking every
/// 25ms and settling 100ms after any transmission.
pub fn run<P: SerialPort>(mut daemon: Daemon, mut port: P, shutdown: Arc<AtomicBool>) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let action = daemon.tick_once(&mut port, now)?;
        let sleep_for = match action {
            TickAction::Idle => IDLE_TICK,
            _ => SETTLE_TICK,
        };
        thread::sleep(sleep_for);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use crate::serial::FakeSerialPort;

    fn test_config() -> Config {
        let cli = Cli {
            config: None,
            serial_device: Some("/dev/ttyUSB0".to_string()),
            master_twcid: None,
            master_sign: None,
            wiring_max_amps_per_twc: Some(40.0),
            wiring_max_amps_all_twcs: Some(40.0),
            min_amps_per_twc: None,
            spike_amps_to_cancel_6a_limit: None,
            fixed_budget_amps: Some(20.0),
            debug_level: 3,
        };
        Config::load(&cli).unwrap()
    }

    fn idle_budget(amps: f64) -> Arc<Mutex<BudgetState>> {
        Arc::new(Mutex::new(BudgetState { max_amps_to_divide: amps }))
    }

    #[test]
    fn startup_burst_emits_ten_framed_messages() {
        let config = test_config();
        let (tx, _rx) = mpsc::channel();
        let mut daemon = Daemon::new(config, idle_budget(20.0), tx);
        let mut port = FakeSerialPort::new(vec![]);
        let now = Instant::now();

        for _ in 0..10 {
            daemon.tick_once(&mut port, now).unwrap();
        }
        let frame_count = port.outbound.iter().filter(|&&b| b == 0xC0).count() / 2;
        assert_eq!(frame_count, 10);
    }

    #[test]
    fn slave_link_ready_is_registered_and_heartbeat_follows() {
        let config = test_config();
        let (tx, _rx) = mpsc::channel();
        let mut daemon = Daemon::new(config, idle_budget(20.0), tx);

        let link_ready_payload = vec![0xFDu8, 0xE2, 0xAB, 0xCD, 0x55, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let framed = encode_frame(&link_ready_payload);
        let mut port = FakeSerialPort::new(framed);
        let now = Instant::now();

        for _ in 0..10 {
            daemon.tick_once(&mut port, now).unwrap();
        }
        assert!(daemon.sm.registry().contains(TWCID([0xAB, 0xCD])));

        port.outbound.clear();
        let action = daemon.tick_once(&mut port, now + Duration::from_secs(2)).unwrap();
        assert!(matches!(action, TickAction::SendHeartbeats(_)));
        assert!(!port.outbound.is_empty());
    }
}
