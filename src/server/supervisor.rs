//! Accept loop, connection registry, and the shared clock thread (spec
//! §4.10).
//!
//! Grounded on the teacher's toy `examples/server.rs` event loop (one
//! `mio::Poll` over a listening socket plus a timer token), generalized to
//! poll both transports via `mio::unix::SourceFd` and hand each accepted
//! connection to its own worker thread rather than multiplexing every
//! client on one loop -- each [`Connection`] already runs its own
//! `mio::Poll` (see `connection.rs`), so the supervisor's only job is
//! accept, dispatch, and capacity enforcement.

use std::net::TcpListener as StdTcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::clock::ClockSource;
use super::connection::{Connection, ConnectionShared};
use super::listener::{bind_tcp, bind_unix, write_pid_file};
use super::wildcard::WildcardRegistry;
use super::{
    Config, ServerError, TimeshiftSink, CLOCK_TICK_INTERVAL, COOKIE_LENGTH, MAX_CONNECTIONS,
};

const TCP_TOKEN: Token = Token(0);
const UNIX_TOKEN: Token = Token(1);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

fn load_cookie(path: &std::path::Path) -> Result<Vec<u8>, ServerError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() != COOKIE_LENGTH {
        return Err(ServerError::BadCookieLength(path.to_owned()));
    }
    Ok(bytes)
}

/// Best-effort peer identity for a UNIX client, read off `SO_PEERCRED`. Used
/// only for wildcard-tag construction (spec §4.11), never for access
/// control.
fn unix_peer_identity(stream: &std::os::unix::net::UnixStream) -> String {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    match getsockopt(stream, PeerCredentials) {
        Ok(cred) => format!("unix:pid={}", cred.pid()),
        Err(_) => "unix:unknown".to_string(),
    }
}

/// Owns both listeners and the clock thread: accepts connections and spawns
/// one worker thread per client until told to stop.
pub struct Supervisor {
    config: Config,
    shared: Arc<ConnectionShared>,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: Config, sink: Arc<dyn TimeshiftSink>) -> Result<Self, ServerError> {
        let expected_cookie = if config.require_auth_cookie {
            match config.auth_cookie_path.as_ref() {
                Some(path) => Some(load_cookie(path)?),
                None => None,
            }
        } else {
            None
        };

        let shared = Arc::new(ConnectionShared {
            wildcards: Arc::new(WildcardRegistry::default()),
            sink,
            clock_source: ClockSource::new(),
            require_auth_cookie: config.require_auth_cookie,
            expected_cookie,
        });

        Ok(Self {
            config,
            shared,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle other threads (e.g. a signal handler) can use to request
    /// shutdown.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn wildcards(&self) -> &Arc<WildcardRegistry> {
        &self.shared.wildcards
    }

    /// Binds whichever transports are configured and runs the accept loop
    /// until the stop handle is set. Fails with [`ServerError::NoTransport`]
    /// if neither transport is configured.
    pub fn run(&self) -> Result<(), ServerError> {
        let tcp = bind_tcp(&self.config)?;
        let unix = bind_unix(&self.config)?;
        if tcp.is_none() && unix.is_none() {
            return Err(ServerError::NoTransport);
        }
        if let Some(dir) = self.config.unix_socket_path.as_ref() {
            write_pid_file(dir)?;
        }
        let unix = unix.map(|(listener, _path)| listener);

        let poll = Poll::new()?;
        if let Some(l) = tcp.as_ref() {
            poll.registry()
                .register(&mut SourceFd(&l.as_raw_fd()), TCP_TOKEN, Interest::READABLE)?;
        }
        if let Some(l) = unix.as_ref() {
            poll.registry()
                .register(&mut SourceFd(&l.as_raw_fd()), UNIX_TOKEN, Interest::READABLE)?;
        }

        let clock_thread = self.spawn_clock_thread();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut events = Events::with_capacity(16);

        while !self.stop.load(Ordering::Relaxed) {
            match poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in &events {
                match event.token() {
                    TCP_TOKEN => self.accept_tcp(tcp.as_ref().unwrap(), &mut workers)?,
                    UNIX_TOKEN => self.accept_unix(unix.as_ref().unwrap(), &mut workers)?,
                    _ => {}
                }
            }

            workers.retain(|handle| !handle.is_finished());
        }

        self.stop.store(true, Ordering::Relaxed);
        for handle in workers {
            let _ = handle.join();
        }
        let _ = clock_thread.join();

        Ok(())
    }

    fn accept_tcp(
        &self,
        listener: &StdTcpListener,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if workers.len() >= MAX_CONNECTIONS {
                log::warn!(target: "screamroute_pulse::supervisor", "rejecting tcp connection from {addr}: at capacity");
                drop(stream);
                continue;
            }

            let peer_identity = format!("tcp:{addr}");
            let conn = Connection::from_tcp(
                stream,
                peer_identity.clone(),
                self.shared.clone(),
                self.stop.clone(),
            )?;
            workers.push(Self::spawn_worker(peer_identity, conn));
        }
    }

    fn accept_unix(
        &self,
        listener: &StdUnixListener,
        workers: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), ServerError> {
        loop {
            let (stream, _addr) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if workers.len() >= MAX_CONNECTIONS {
                log::warn!(target: "screamroute_pulse::supervisor", "rejecting unix connection: at capacity");
                drop(stream);
                continue;
            }

            let peer_identity = unix_peer_identity(&stream);
            let conn = Connection::from_unix(
                stream,
                peer_identity.clone(),
                self.shared.clone(),
                self.stop.clone(),
            )?;
            workers.push(Self::spawn_worker(peer_identity, conn));
        }
    }

    fn spawn_worker(peer_identity: String, mut conn: Connection) -> JoinHandle<()> {
        std::thread::spawn(move || {
            log::info!(target: "screamroute_pulse::supervisor", "{peer_identity}: connected");
            if let Err(e) = conn.run() {
                log::warn!(target: "screamroute_pulse::supervisor", "{peer_identity}: worker exited: {e}");
            } else {
                log::info!(target: "screamroute_pulse::supervisor", "{peer_identity}: disconnected");
            }
        })
    }

    /// Ticks the shared clock on a fixed interval until stopped (spec §4.9).
    fn spawn_clock_thread(&self) -> JoinHandle<()> {
        let clock_source = self.shared.clock_source.clone();
        let stop = self.stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(CLOCK_TICK_INTERVAL);
                clock_source.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::LoggingTimeshiftSink;

    #[test]
    fn new_fails_cleanly_on_missing_cookie_file() {
        let config = Config {
            require_auth_cookie: true,
            auth_cookie_path: Some(std::path::PathBuf::from("/nonexistent/cookie")),
            ..Config::default()
        };

        let result = Supervisor::new(config, Arc::new(LoggingTimeshiftSink));
        assert!(result.is_err());
    }

    #[test]
    fn run_reports_no_transport_when_unconfigured() {
        let supervisor = Supervisor::new(Config::default(), Arc::new(LoggingTimeshiftSink)).unwrap();
        assert!(matches!(supervisor.run(), Err(ServerError::NoTransport)));
    }
}
