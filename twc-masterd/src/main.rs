// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry point: parse flags, load config, open the bus, and run until
//! Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use twc_masterd::collaborators::{FixedBudgetProvider, NullVehicleApiClient};
use twc_masterd::config::{Cli, Config};
use twc_masterd::daemon::{self, BudgetState, Daemon};
use twc_masterd::serial::RealSerialPort;

/// How often the background thread polls the budget provider.
const BUDGET_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.tracing_filter()))
        .init();

    tracing::info!(
        serial_device = %config.serial_device,
        master_twcid = %config.master_twcid,
        "starting up",
    );

    let port = RealSerialPort::open(&config.serial_device)
        .with_context(|| format!("opening {}", config.serial_device))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received interrupt, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;
    }

    let budget = Arc::new(Mutex::new(BudgetState {
        max_amps_to_divide: config.fixed_budget_amps,
    }));
    let budget_provider = Arc::new(FixedBudgetProvider::new(config.fixed_budget_amps));
    let budget_poller = daemon::spawn_budget_poller(
        Arc::clone(&budget),
        budget_provider,
        BUDGET_POLL_INTERVAL,
        Arc::clone(&shutdown),
    );

    let (vehicle_tx, vehicle_rx) = std::sync::mpsc::channel();
    let vehicle_client = Arc::new(NullVehicleApiClient::new());
    let vehicle_worker = daemon::spawn_vehicle_api_worker(vehicle_rx, vehicle_client);

    let daemon = Daemon::new(config, budget, vehicle_tx);
    let result = daemon::run(daemon, port, Arc::clone(&shutdown));

    shutdown.store(true, Ordering::SeqCst);
    drop(budget_poller.join());
    drop(vehicle_worker.join());

    result
}
