// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The typed opcode table: parsing decoded payloads into [`Message`]s and
//! building payloads to send.
//!
//! Opcode dispatch is a small `match` over the first two payload bytes —
//! a lookup table, not a parser-combinator or regex.

use crate::error::ParseError;
use crate::twcid::{Sign, TWCID};

/// Which generation of heartbeat a slave speaks, inferred from the
/// length of its link-ready frame (14 bytes total => V1, 16 => V2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    /// Length of the data portion following opcode/sender/receiver in a
    /// heartbeat frame for this version.
    pub const fn heartbeat_data_len(self) -> usize {
        match self {
            ProtocolVersion::V1 => 7,
            ProtocolVersion::V2 => 9,
        }
    }

    pub const fn min_amps_supported(self) -> f64 {
        match self {
            ProtocolVersion::V1 => 5.0,
            ProtocolVersion::V2 => 6.0,
        }
    }
}

/// Command byte carried in byte 0 of a master heartbeat's data portion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterHeartbeatCommand {
    /// `00`: no change; slave already reports the desired current.
    NoChange,
    /// `02`: error; `bitmap` drives the slave's error LED pattern.
    Error { bitmap: u16 },
    /// `05`: set current limit (V1, or V2 before a charge session starts).
    SetCurrent,
    /// `06`: V2 probe, raise slave current by 2 A.
    ProbeRaise,
    /// `07`: V2 probe, lower slave current by 2 A.
    ProbeLower,
    /// `08`: V2 ack that the slave stopped charging.
    AckStopped,
    /// `09`: V2 set current limit (replaces `05` once charging has begun).
    SetCurrentV2,
}

impl MasterHeartbeatCommand {
    fn opcode_byte(self) -> u8 {
        match self {
            MasterHeartbeatCommand::NoChange => 0x00,
            MasterHeartbeatCommand::Error { .. } => 0x02,
            MasterHeartbeatCommand::SetCurrent => 0x05,
            MasterHeartbeatCommand::ProbeRaise => 0x06,
            MasterHeartbeatCommand::ProbeLower => 0x07,
            MasterHeartbeatCommand::AckStopped => 0x08,
            MasterHeartbeatCommand::SetCurrentV2 => 0x09,
        }
    }
}

/// A decoded, checksum-valid frame, typed by opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `FC E1`: master advertising its TWCID at startup.
    LinkReady1 { sender: TWCID, sign: Sign },
    /// `FB E2`: master eliciting slave link-ready responses.
    LinkReady2 { sender: TWCID, sign: Sign },
    /// `FB E0`: master heartbeat addressed to one slave.
    MasterHeartbeat {
        sender: TWCID,
        receiver: TWCID,
        command: MasterHeartbeatCommand,
        amps: f64,
        plugged_in: bool,
    },
    /// `FD E2`: a slave advertising readiness to link.
    SlaveLinkReady {
        sender: TWCID,
        sign: Sign,
        max_amps: f64,
    },
    /// `FD E0`: a slave's periodic heartbeat.
    SlaveHeartbeat {
        sender: TWCID,
        receiver: TWCID,
        state: u8,
        reported_amps_max: f64,
        reported_amps_actual: f64,
        tail: Vec<u8>,
    },
    /// `FD EB`: informational kWh/voltage report. Never consulted by the
    /// allocation policy, surfaced for logs only.
    KwhVoltageReport {
        sender: TWCID,
        total_kwh: u32,
        phase_voltages: Vec<u16>,
    },
    /// `FC E1`/`FC E2` observed from the bus with a sender other than us:
    /// another device is acting as master. Fatal configuration error,
    /// but the core itself only reports it.
    MasterCollision { opcode: [u8; 2], sender: [u8; 2] },
    /// Recognized frame shape we don't otherwise model, or a opcode the
    /// core doesn't know. Logged and ignored by the caller.
    Unknown { opcode: [u8; 2] },
}

fn be_centiamps(hi: u8, lo: u8) -> f64 {
    (((hi as u16) << 8) | lo as u16) as f64 / 100.0
}

fn centiamps_be(amps: f64) -> [u8; 2] {
    let raw = (amps * 100.0).round() as u16;
    raw.to_be_bytes()
}

/// Parses a checksum-valid, unescaped payload (opcode through the last
/// data byte, no checksum) into a typed [`Message`].
///
/// `master` is our own TWCID, used to validate the receiver field on
/// frames addressed to us.
pub fn parse_message(payload: &[u8], master: TWCID) -> Result<Message, ParseError> {
    if payload.len() < 2 {
        return Err(ParseError::Empty);
    }
    let opcode = [payload[0], payload[1]];

    match opcode {
        [0xFC, 0xE1] | [0xFC, 0xE2] => {
            let sender = [
                payload.get(2).copied().unwrap_or(0),
                payload.get(3).copied().unwrap_or(0),
            ];
            Ok(Message::MasterCollision { opcode, sender })
        }
        [0xFB, 0xE2] if payload.len() >= 6 => Ok(Message::LinkReady2 {
            sender: TWCID::from_bytes([payload[2], payload[3]]),
            sign: Sign(payload[4]),
        }),
        [0xFD, 0xE2] if payload.len() >= 7 => {
            let sender = TWCID::from_bytes([payload[2], payload[3]]);
            let sign = Sign(payload[4]);
            let max_amps = be_centiamps(payload[5], payload[6]);
            Ok(Message::SlaveLinkReady { sender, sign, max_amps })
        }
        [0xFB, 0xE0] if payload.len() >= 8 => {
            let sender = TWCID::from_bytes([payload[2], payload[3]]);
            let receiver = TWCID::from_bytes([payload[4], payload[5]]);
            let cmd_byte = payload[6];
            let b1 = payload.get(7).copied().unwrap_or(0);
            let b2 = payload.get(8).copied().unwrap_or(0);
            let command = match cmd_byte {
                0x00 => MasterHeartbeatCommand::NoChange,
                0x02 => MasterHeartbeatCommand::Error {
                    bitmap: ((b1 as u16) << 8) | b2 as u16,
                },
                0x05 => MasterHeartbeatCommand::SetCurrent,
                0x06 => MasterHeartbeatCommand::ProbeRaise,
                0x07 => MasterHeartbeatCommand::ProbeLower,
                0x08 => MasterHeartbeatCommand::AckStopped,
                0x09 => MasterHeartbeatCommand::SetCurrentV2,
                _ => return Err(ParseError::UnknownOpcode(opcode)),
            };
            let amps = be_centiamps(b1, b2);
            let plugged_in = payload.get(9).copied().unwrap_or(0) != 0;
            Ok(Message::MasterHeartbeat {
                sender,
                receiver,
                command,
                amps,
                plugged_in,
            })
        }
        [0xFD, 0xE0] if payload.len() >= 8 => {
            let sender = TWCID::from_bytes([payload[2], payload[3]]);
            let receiver = TWCID::from_bytes([payload[4], payload[5]]);
            if receiver != master && receiver != TWCID::from_bytes([0, 0]) {
                return Err(ParseError::WrongReceiver {
                    expected: master.as_bytes(),
                    found: receiver.as_bytes(),
                });
            }
            let state = payload[6];
            let reported_amps_max = be_centiamps(payload[7], payload.get(8).copied().unwrap_or(0));
            let reported_amps_actual = if payload.len() > 10 {
                be_centiamps(payload[9], payload[10])
            } else {
                0.0
            };
            let tail = payload[payload.len().min(11)..].to_vec();
            Ok(Message::SlaveHeartbeat {
                sender,
                receiver,
                state,
                reported_amps_max,
                reported_amps_actual,
                tail,
            })
        }
        [0xFD, 0xEB] if payload.len() >= 6 => {
            let sender = TWCID::from_bytes([payload[2], payload[3]]);
            let total_kwh = u32::from_be_bytes([
                payload.get(4).copied().unwrap_or(0),
                payload.get(5).copied().unwrap_or(0),
                payload.get(6).copied().unwrap_or(0),
                payload.get(7).copied().unwrap_or(0),
            ]);
            let mut phase_voltages = Vec::new();
            let mut i = 8;
            while i + 1 < payload.len() {
                phase_voltages.push(u16::from_be_bytes([payload[i], payload[i + 1]]));
                i += 2;
            }
            Ok(Message::KwhVoltageReport {
                sender,
                total_kwh,
                phase_voltages,
            })
        }
        _ => Ok(Message::Unknown { opcode }),
    }
}

/// Builds a link-ready-1 payload (`FC E1`), opcode through the final
/// zero byte, ready for [`crate::frame::encode_frame`].
pub fn build_link_ready1(master: TWCID, sign: Sign) -> Vec<u8> {
    let mut out = vec![0xFC, 0xE1];
    out.extend_from_slice(&master.as_bytes());
    out.push(sign.0);
    out.extend_from_slice(&[0; 8]);
    out
}

/// Builds a link-ready-2 payload (`FB E2`).
pub fn build_link_ready2(master: TWCID, sign: Sign) -> Vec<u8> {
    let mut out = vec![0xFB, 0xE2];
    out.extend_from_slice(&master.as_bytes());
    out.push(sign.0);
    out.extend_from_slice(&[0; 8]);
    out
}

/// Builds a master heartbeat payload (`FB E0`) addressed to `receiver`.
pub fn build_master_heartbeat(
    master: TWCID,
    receiver: TWCID,
    version: ProtocolVersion,
    command: MasterHeartbeatCommand,
    amps: f64,
    plugged_in: bool,
) -> Vec<u8> {
    let mut out = vec![0xFB, 0xE0];
    out.extend_from_slice(&master.as_bytes());
    out.extend_from_slice(&receiver.as_bytes());
    out.push(command.opcode_byte());

    let amps_or_bitmap = match command {
        MasterHeartbeatCommand::Error { bitmap } => bitmap.to_be_bytes(),
        _ => centiamps_be(amps),
    };
    out.extend_from_slice(&amps_or_bitmap);
    out.push(u8::from(plugged_in));
    out.extend_from_slice(&[0; 3]);
    if version == ProtocolVersion::V2 {
        out.extend_from_slice(&[0; 2]);
    }
    out
}
