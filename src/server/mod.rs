//! Server-side implementation of the PulseAudio native protocol: listeners,
//! per-connection state machines, command handlers, and the clock-driven
//! packet dispatcher that feeds a [`TimeshiftSink`].

mod clock;
mod connection;
mod handlers;
mod listener;
mod memfd;
mod ring;
mod stream;
mod supervisor;
mod wildcard;

pub use clock::{ClockHandle, ClockSource};
pub use supervisor::Supervisor;
pub use wildcard::{WildcardObserver, WildcardRegistry};

use std::path::PathBuf;

/// The name and index under which the single virtual sink is advertised.
pub const SINK_NAME: &str = "screamrouter.pulse";
pub const SINK_INDEX: u32 = 0;
pub const SINK_DESCRIPTION: &str = "ScreamRouter";

/// The name and index under which the monitor source is advertised.
pub const SOURCE_NAME: &str = "screamrouter.monitor";
pub const SOURCE_INDEX: u32 = 1;
pub const SOURCE_DESCRIPTION: &str = "Monitor of ScreamRouter";

pub const DRIVER_NAME: &str = "screamroute.virtual";

/// Maximum number of concurrently accepted connections.
pub const MAX_CONNECTIONS: usize = 64;

/// Default chunk size used to size the flow-control granularity and
/// `minreq` buffer attribute (in bytes).
pub const DEFAULT_CHUNK_BYTES: u32 = 1152;

pub const DEFAULT_MAXLENGTH: u32 = 2 * 48 * 1024;
pub const DEFAULT_TLENGTH: u32 = 48 * 1024;
pub const DEFAULT_PREBUF: u32 = 0;

pub const CATCHUP_CAP_USEC: u64 = 50_000;
pub const UNDERRUN_RESET_USEC: u64 = 500_000;

pub const COOKIE_LENGTH: usize = 256;

/// Interval at which the shared clock collaborator's sequence is advanced
/// (spec §4.9/§5). Small relative to a chunk's duration so pacing is driven
/// by each stream's own wall-clock bookkeeping rather than by tick
/// granularity.
pub const CLOCK_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);

/// Cap on the poll timeout a worker uses while a stream has a due REQUEST
/// pending (spec §5 "Worker loop").
pub const WORKER_POLL_CAP: std::time::Duration = std::time::Duration::from_millis(5);

/// Configuration accepted from the embedding process (CLI flags, TOML file,
/// or both -- CLI flags take precedence). Mirrors spec §6's configuration
/// record.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// TCP port to listen on. `0` disables the TCP transport.
    #[serde(default)]
    pub tcp_listen_port: u16,

    /// Whether clients must present a valid auth cookie.
    #[serde(default)]
    pub require_auth_cookie: bool,

    /// Directory holding the `native` UNIX socket and `pid` file. `None`
    /// disables the UNIX transport.
    #[serde(default)]
    pub unix_socket_path: Option<PathBuf>,

    /// Path to the 256-byte auth cookie file, if cookie auth is enabled.
    #[serde(default)]
    pub auth_cookie_path: Option<PathBuf>,

    #[serde(default)]
    pub socket_owner_user: Option<String>,

    #[serde(default)]
    pub socket_owner_group: Option<String>,

    /// POSIX permission bits for the UNIX socket. Defaults to `0o660`.
    #[serde(default = "default_socket_permissions")]
    pub socket_permissions: u32,
}

fn default_socket_permissions() -> u32 {
    0o660
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_listen_port: 0,
            require_auth_cookie: false,
            unix_socket_path: None,
            auth_cookie_path: None,
            socket_owner_user: None,
            socket_owner_group: None,
            socket_permissions: default_socket_permissions(),
        }
    }
}

/// A single chunk-aligned, timestamped audio packet handed off to the
/// downstream mixing pipeline. The timeshift/mixing machinery itself is an
/// external collaborator; this crate only defines the narrow interface it
/// consumes against.
#[derive(Debug, Clone)]
pub struct TimeshiftPacket {
    /// The stream's wildcard/composite source tag.
    pub source_tag: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Always 32 after internal Float32LE -> S32LE normalization.
    pub bit_depth: u8,
    pub channel_layout: Vec<u8>,
    pub playback_rate: f32,
    pub audio_data: Vec<u8>,
    pub rtp_timestamp: u32,
    pub received_time: std::time::Instant,
}

/// The narrow interface this receiver needs from the downstream
/// timeshift/mixing pipeline (spec §1, §4.5, §4.9). The real pipeline is out
/// of scope; this trait is the seam.
pub trait TimeshiftSink: Send + Sync {
    /// Hands off one chunk-aligned packet for a stream.
    fn push_packet(&self, packet: TimeshiftPacket);

    /// Tells the collaborator that a stream's timeline has been reset
    /// (deleted, or otherwise no longer contiguous with prior packets).
    fn reset_stream(&self, source_tag: &str);
}

/// A trivial [`TimeshiftSink`] that only logs. Used by the default binary
/// and by tests in place of the real mixing pipeline.
#[derive(Debug, Default)]
pub struct LoggingTimeshiftSink;

impl TimeshiftSink for LoggingTimeshiftSink {
    fn push_packet(&self, packet: TimeshiftPacket) {
        log::trace!(
            target: "screamroute_pulse::timeshift",
            "{} bytes for {:?} @ rtp={}",
            packet.audio_data.len(),
            packet.source_tag,
            packet.rtp_timestamp
        );
    }

    fn reset_stream(&self, source_tag: &str) {
        log::debug!(target: "screamroute_pulse::timeshift", "reset {source_tag:?}");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("neither TCP nor UNIX transport could be started")]
    NoTransport,

    #[error("auth cookie at {0:?} has the wrong length (expected {COOKIE_LENGTH} bytes)")]
    BadCookieLength(PathBuf),

    #[error("memfd registered for shm_id {0} has zero size")]
    BadMemfdSize(u32),

    #[error("no memfd registered for shm_id {0}")]
    UnknownMemfdBlock(u32),

    #[error("memfd read out of bounds: shm_id={shm_id} offset={offset} length={length}")]
    InvalidMemfdRange { shm_id: u32, offset: u32, length: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }
}
