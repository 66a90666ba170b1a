//! Logging support.
//!
//! Two layers, same as the rest of the Rust ecosystem this crate grew out
//! of: [`tracing`] for structured, span-scoped events emitted by agents,
//! and [`flexi_logger`] so anything still going through the `log` facade
//! (some `nix`/`libc` call sites do, transitively) lands in the same sink.

use eyre::{Result, WrapErr};
use flexi_logger::{FileSpec, Logger};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes logging for the daemon process.
///
/// `verbosity` is the number of `-v` flags on the command line: `0` maps
/// to `info`, `1` to `debug`, `2+` to `trace`. `RUST_LOG` always takes
/// precedence when set.
pub fn init(verbosity: u8) -> Result<()> {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("osp_agent={default_level},agentwire={default_level}")));
    fmt().with_env_filter(filter).with_target(true).try_init().map_err(|err| eyre::eyre!(err))?;

    Logger::try_with_str("info")
        .wrap_err("building flexi_logger")?
        .log_to_file(FileSpec::default().directory("/var/log/opensync"))
        .duplicate_to_stderr(flexi_logger::Duplicate::Warn)
        .start()
        .wrap_err("starting flexi_logger")?;

    Ok(())
}

/// Initializes a minimal stderr-only logger, for short-lived CLI binaries
/// (`print-config`-style tools) that don't need a log file.
pub fn init_for_tool() {
    let _ = fmt().with_env_filter(EnvFilter::new("warn")).try_init();
}
