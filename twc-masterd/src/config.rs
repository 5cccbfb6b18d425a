// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration surface: a `clap::Parser` CLI layered over an optional
//! TOML file, matching the `build/xtask` shape of a `RawConfig` deserialized
//! from disk and then validated into a usable [`Config`].

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use twc_protocol::{ConfigError, Sign, TWCID};

/// `twc-masterd` impersonates a Tesla Wall Connector master on an
/// RS-485 bus so an external supervisor can regulate slave current.
#[derive(Debug, Parser)]
#[clap(max_term_width = 80)]
pub struct Cli {
    /// Path to a TOML config file. CLI flags below override its values.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Serial device to open (e.g. /dev/ttyUSB0).
    #[clap(long)]
    pub serial_device: Option<String>,

    /// Impersonated master TWCID, as 4 hex digits (e.g. 7777).
    #[clap(long)]
    pub master_twcid: Option<String>,

    /// Sign byte accompanying our TWCID, as 2 hex digits.
    #[clap(long)]
    pub master_sign: Option<String>,

    /// Per-TWC wiring ceiling, in amps.
    #[clap(long)]
    pub wiring_max_amps_per_twc: Option<f64>,

    /// Aggregate wiring ceiling across the whole bus, in amps.
    #[clap(long)]
    pub wiring_max_amps_all_twcs: Option<f64>,

    /// User-level floor to offer any slave, in amps.
    #[clap(long)]
    pub min_amps_per_twc: Option<f64>,

    /// "6A stuck" spike value, in amps.
    #[clap(long)]
    pub spike_amps_to_cancel_6a_limit: Option<f64>,

    /// Fixed amperage budget for the reference `FixedBudgetProvider`,
    /// when no real budget provider is wired in.
    #[clap(long)]
    pub fixed_budget_amps: Option<f64>,

    /// Verbosity, 0 (errors only) through 12 (trace). Also honored via
    /// `RUST_LOG` if that's set.
    #[clap(long, default_value_t = 3)]
    pub debug_level: u8,
}

/// An `app.toml`-style config file, deserialized before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
struct RawConfig {
    serial_device: Option<String>,
    master_twcid: Option<String>,
    master_sign: Option<String>,
    wiring_max_amps_per_twc: Option<f64>,
    wiring_max_amps_all_twcs: Option<f64>,
    min_amps_per_twc: Option<f64>,
    spike_amps_to_cancel_6a_limit: Option<f64>,
    fixed_budget_amps: Option<f64>,
    debug_level: Option<u8>,
}

/// Fully resolved, validated configuration the binary runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub serial_device: String,
    pub master_twcid: TWCID,
    pub master_sign: Sign,
    pub wiring_max_amps_per_twc: f64,
    pub wiring_max_amps_all_twcs: f64,
    pub min_amps_per_twc: f64,
    pub spike_amps_to_cancel_6a_limit: f64,
    pub fixed_budget_amps: f64,
    pub debug_level: u8,
}

fn parse_hex_twcid(s: &str) -> Result<TWCID> {
    let bytes = hex2(s).context("master-twcid must be 4 hex digits")?;
    Ok(TWCID::from_bytes(bytes))
}

fn parse_hex_sign(s: &str) -> Result<Sign> {
    let trimmed = s.trim();
    let byte = u8::from_str_radix(trimmed, 16).context("master-sign must be 2 hex digits")?;
    Ok(Sign(byte))
}

/// Falls back to the first USB-attached serial adapter when no device
/// was configured explicitly, so a single-adapter setup needs no flag
/// at all. Returns `None` (never an error) if enumeration fails or
/// turns up nothing, leaving `Config::load` to report the combined
/// failure.
fn default_usb_serial_device() -> Option<String> {
    serialport::available_ports()
        .ok()?
        .into_iter()
        .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
}

fn hex2(s: &str) -> Result<[u8; 2]> {
    let trimmed = s.trim();
    if trimmed.len() != 4 {
        bail!("expected 4 hex digits, got {trimmed:?}");
    }
    let hi = u8::from_str_radix(&trimmed[0..2], 16)?;
    let lo = u8::from_str_radix(&trimmed[2..4], 16)?;
    Ok([hi, lo])
}

impl Config {
    /// Loads the optional config file, then layers CLI overrides on top
    /// (CLI wins), and validates the result.
    pub fn load(cli: &Cli) -> Result<Self> {
        let raw = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<RawConfig>(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => RawConfig::default(),
        };

        let serial_device = cli
            .serial_device
            .clone()
            .or(raw.serial_device)
            .or_else(default_usb_serial_device)
            .context(
                "serial-device not set and no USB-RS485 adapter was auto-detected \
                 (pass --serial-device or set it in --config)",
            )?;

        let master_twcid = match cli.master_twcid.clone().or(raw.master_twcid) {
            Some(s) => parse_hex_twcid(&s)?,
            None => TWCID::DEFAULT_MASTER,
        };
        let master_sign = match cli.master_sign.clone().or(raw.master_sign) {
            Some(s) => parse_hex_sign(&s)?,
            None => Sign::DEFAULT_MASTER,
        };

        let wiring_max_amps_per_twc = cli
            .wiring_max_amps_per_twc
            .or(raw.wiring_max_amps_per_twc)
            .context("wiring-max-amps-per-twc not set")?;
        let wiring_max_amps_all_twcs = cli
            .wiring_max_amps_all_twcs
            .or(raw.wiring_max_amps_all_twcs)
            .context("wiring-max-amps-all-twcs not set")?;
        let min_amps_per_twc = cli.min_amps_per_twc.or(raw.min_amps_per_twc).unwrap_or(6.0);
        let spike_amps_to_cancel_6a_limit = cli
            .spike_amps_to_cancel_6a_limit
            .or(raw.spike_amps_to_cancel_6a_limit)
            .unwrap_or(twc_protocol::registry::DEFAULT_SPIKE_AMPS);
        let fixed_budget_amps = cli.fixed_budget_amps.or(raw.fixed_budget_amps).unwrap_or(0.0);
        let debug_level = if cli.debug_level != 3 { cli.debug_level } else { raw.debug_level.unwrap_or(3) };

        let config = Config {
            serial_device,
            master_twcid,
            master_sign,
            wiring_max_amps_per_twc,
            wiring_max_amps_all_twcs,
            min_amps_per_twc,
            spike_amps_to_cancel_6a_limit,
            fixed_budget_amps,
            debug_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.wiring_max_amps_per_twc > self.wiring_max_amps_all_twcs {
            return Err(ConfigError::PerTwcExceedsAggregate {
                per_twc: self.wiring_max_amps_per_twc,
                aggregate: self.wiring_max_amps_all_twcs,
            }
            .into());
        }
        if self.wiring_max_amps_per_twc <= 0.0 || self.wiring_max_amps_all_twcs <= 0.0 {
            bail!("wiring ceilings must be positive");
        }
        Ok(())
    }

    /// Maps `debug_level` onto a `tracing` filter string, honoring
    /// `RUST_LOG` first if it's set.
    pub fn tracing_filter(&self) -> String {
        if std::env::var("RUST_LOG").is_ok() {
            return std::env::var("RUST_LOG").unwrap();
        }
        let level = match self.debug_level {
            0 => "error",
            1..=2 => "warn",
            3..=4 => "info",
            5..=9 => "debug",
            _ => "trace",
        };
        format!("twc_masterd={level},twc_protocol={level}")
    }
}
