//! Listener setup for the TCP and UNIX transports (spec §4.1, §4.10).
//!
//! Grounded on the teacher's toy `examples/server.rs`, which binds a single
//! `mio::net::UnixListener`; generalized here to also bind TCP, and to apply
//! the socket ownership/permission bits a real daemon needs when its runtime
//! directory is shared with other users (e.g. PulseAudio's own `native`
//! socket convention).

use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Group, Uid, User};

use super::{Config, ServerError};

/// The UNIX socket's conventional file name within `unix_socket_path`.
pub const SOCKET_FILE_NAME: &str = "native";

/// Binds the TCP transport, if `config.tcp_listen_port` is nonzero.
pub fn bind_tcp(config: &Config) -> Result<Option<StdTcpListener>, ServerError> {
    if config.tcp_listen_port == 0 {
        return Ok(None);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.tcp_listen_port));
    let listener = StdTcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;

    log::info!(target: "screamroute_pulse::listener", "listening on tcp:{addr}");
    Ok(Some(listener))
}

/// Binds the UNIX transport, if `config.unix_socket_path` is set. Removes a
/// stale socket file left behind by a prior, uncleanly-terminated run before
/// binding, and applies the configured ownership/permission bits afterward.
pub fn bind_unix(config: &Config) -> Result<Option<(StdUnixListener, PathBuf)>, ServerError> {
    let Some(dir) = config.unix_socket_path.as_ref() else {
        return Ok(None);
    };

    fs::create_dir_all(dir)?;
    let socket_path = dir.join(SOCKET_FILE_NAME);

    match fs::remove_file(&socket_path) {
        Ok(()) => log::debug!(target: "screamroute_pulse::listener", "removed stale socket at {socket_path:?}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = StdUnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;

    apply_socket_ownership(&socket_path, config)?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(config.socket_permissions))?;

    log::info!(target: "screamroute_pulse::listener", "listening on unix:{socket_path:?}");
    Ok(Some((listener, socket_path)))
}

fn apply_socket_ownership(path: &Path, config: &Config) -> Result<(), ServerError> {
    if config.socket_owner_user.is_none() && config.socket_owner_group.is_none() {
        return Ok(());
    }

    let uid = config
        .socket_owner_user
        .as_deref()
        .map(resolve_uid)
        .transpose()?;
    let gid = config
        .socket_owner_group
        .as_deref()
        .map(resolve_gid)
        .transpose()?;

    chown(path, uid, gid).map_err(ServerError::from)
}

fn resolve_uid(name: &str) -> Result<Uid, ServerError> {
    match User::from_name(name)? {
        Some(user) => Ok(user.uid),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such user: {name}"),
        )
        .into()),
    }
}

fn resolve_gid(name: &str) -> Result<Gid, ServerError> {
    match Group::from_name(name)? {
        Some(group) => Ok(group.gid),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such group: {name}"),
        )
        .into()),
    }
}

/// Writes a `pid` file alongside the UNIX socket, in the directory
/// PulseAudio clients conventionally expect one (spec §4.10).
pub fn write_pid_file(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join("pid");
    fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_tcp_is_none_when_port_is_zero() {
        let config = Config::default();
        assert!(bind_tcp(&config).unwrap().is_none());
    }

    #[test]
    fn bind_unix_is_none_without_a_configured_path() {
        let config = Config::default();
        assert!(bind_unix(&config).unwrap().is_none());
    }

    #[test]
    fn bind_unix_creates_socket_with_configured_permissions() {
        let dir = std::env::temp_dir().join(format!("screamroute-pulse-test-{}", std::process::id()));
        let config = Config {
            unix_socket_path: Some(dir.clone()),
            socket_permissions: 0o600,
            ..Config::default()
        };

        let (listener, path) = bind_unix(&config).unwrap().expect("unix listener");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        drop(listener);
        let _ = fs::remove_dir_all(&dir);
    }
}
