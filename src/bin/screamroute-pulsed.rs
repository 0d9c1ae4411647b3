//! Standalone binary wiring a [`screamroute_pulse::server::Supervisor`] up to
//! CLI flags / a TOML config file and a logging-only timeshift sink (spec
//! §6).
//!
//! CLI flags follow the teacher pack's `clap::Parser` derive style (see
//! `itsmontoya-scribble`'s `scribble-server` binary); the config-file layer
//! is unique to this receiver, since the teacher crate is a library with no
//! binary of its own.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use screamroute_pulse::server::{Config, LoggingTimeshiftSink, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "screamroute-pulsed")]
#[command(about = "PulseAudio native-protocol receiver for ScreamRouter")]
struct Args {
    /// Path to a TOML config file. Omit to run with built-in defaults (UNIX
    /// transport at $XDG_RUNTIME_DIR/pulse, no cookie auth).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the config file's (or default) TCP listen port. `0` disables TCP.
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Overrides the config file's (or default) UNIX socket directory.
    #[arg(long)]
    unix_socket_path: Option<PathBuf>,

    /// Requires clients to present a valid auth cookie.
    #[arg(long)]
    require_auth_cookie: bool,
}

fn default_config() -> Config {
    let unix_socket_path = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .map(|dir| dir.join("pulse"));

    Config {
        unix_socket_path,
        ..Config::default()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_file(path)?,
        None => default_config(),
    };

    if let Some(port) = args.tcp_port {
        config.tcp_listen_port = port;
    }
    if let Some(path) = args.unix_socket_path {
        config.unix_socket_path = Some(path);
    }
    if args.require_auth_cookie {
        config.require_auth_cookie = true;
    }

    let supervisor = Supervisor::new(config, Arc::new(LoggingTimeshiftSink))?;

    log::info!(target: "screamroute_pulse::supervisor", "starting screamroute-pulsed");
    supervisor.run()?;

    Ok(())
}
