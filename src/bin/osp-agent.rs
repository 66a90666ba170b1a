#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic)]

//! The `osp-agent` daemon: wires the Latency Observation Pipeline, the
//! MAP-T/MAP-E derivation engine, and the Thermal Control Loop to the
//! host OS and to each other, then idles until told to stop.
//!
//! This binary deliberately stops at "runnable": PID files, a full
//! config-store watch client, and daemonization are all out of scope
//! (there's no real config-store transport to watch yet, and none of
//! that lifecycle plumbing changes how the three core loops behave).
//! What's here is enough to stand the agents up against real platform
//! adapters and let them run.

use clap::Parser;
use eyre::{Result, WrapErr as _};
use osp_agent::{agents::thermal, clock::SystemClock, config_store, lop, map, netif, report_bus, sampler};
use std::{path::PathBuf, sync::Arc};

/// Command-line flags for the `osp-agent` daemon.
#[derive(Parser, Debug)]
#[clap(about, version)]
struct Cli {
    /// Directory the config store reads its rows from.
    #[clap(long, default_value = "/usr/opensync/etc")]
    config_dir: PathBuf,
    /// Unix-domain socket the report bus adapter sends encoded reports to.
    #[clap(long, default_value = "/var/run/osp-agent/report-bus.sock")]
    report_bus_endpoint: PathBuf,
    /// Increase log verbosity (`-v` debug, `-vv` trace).
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
    /// Skip platform-apply shell-outs (MAP tunnel/NDP-proxy setup); every
    /// other loop still runs against its real adapter.
    #[clap(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger_init(cli.verbose)?;
    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(cli))
}

fn logger_init(verbosity: u8) -> Result<()> {
    color_eyre::install()?;
    osp_agent::logger::init(verbosity)
}

async fn run(cli: Cli) -> Result<()> {
    tracing::info!(config_dir = %cli.config_dir.display(), dry_run = cli.dry_run, "osp-agent starting");

    let netif_events = netif::Linux::spawn();

    let sampler = sampler::Linux::spawn();
    let sampler_events = sampler.subscribe();
    let core = lop::Core::new(Box::new(sampler));
    let clock = Arc::new(SystemClock);
    let lop_handle = lop::spawn(core, sampler_events, netif_events, clock);

    // Placeholder single-state, zero-source table until the config store
    // pushes a real one via `thermal::Input::SetThermalTable`.
    let placeholder_table = vec![thermal::ThermalTableRow { temp_thresh: Vec::new(), radio_txchainmask: Vec::new(), fan_rpm: 0 }];
    let thermal_controller =
        thermal::Controller::new(placeholder_table, 0).wrap_err("building initial thermal controller")?;
    let thermal_platform: Box<dyn thermal::Platform> = Box::new(thermal::Linux);
    let thermal_reboot: Box<dyn thermal::RebootRequester> = Box::new(thermal::Process);
    let (thermal_handle, thermal_join) = agentwire::spawn(thermal::Loop::new(thermal_controller, thermal_platform, thermal_reboot));

    let map_platform: Box<dyn map::PlatformApply> =
        if cli.dry_run { Box::new(map::NoopPlatform) } else { Box::new(map::Linux) };

    let bus = report_bus::Uds::connect(&cli.report_bus_endpoint)
        .wrap_err_with(|| format!("connecting to report bus at {}", cli.report_bus_endpoint.display()))?;

    let node_id = hostname();
    // No config-store watch transport exists yet (the store is an
    // external collaborator); `_adapter` owns its own `firewall::Registry`
    // and is ready to consume `Update`s the moment one exists.
    let _adapter = config_store::LiveAdapter::new(node_id, bus, lop_handle, map_platform, thermal_handle);

    tokio::select! {
        result = thermal_join => {
            match result {
                Ok(Ok(())) => tracing::warn!("thermal loop exited"),
                Ok(Err(err)) => tracing::error!(%err, "thermal loop exited with error"),
                Err(err) => tracing::error!(%err, "thermal loop task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
    }

    Ok(())
}

fn hostname() -> String {
    std::env::var("NODE_ID").unwrap_or_else(|_| "osp-agent".to_string())
}
