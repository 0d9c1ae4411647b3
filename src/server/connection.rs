//! Per-connection state machine and I/O worker loop (spec §4.6, §4.10).
//!
//! Each live client gets exactly one [`Connection`], owned by exactly one
//! worker thread. The worker polls a single fd, assembles frames out of
//! whatever partial reads arrive, and drains its own outgoing write queue.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::protocol::{
    self, Command, CommandReply, Descriptor, DescriptorFlags, ProtocolError, PulseError,
    SubscriptionMask,
};

use super::clock::{ClockHandle, ClockSource};
use super::memfd::MemfdPool;
use super::stream::{ClockTick, Stream};
use super::wildcard::WildcardRegistry;
use super::{ServerError, TimeshiftPacket, TimeshiftSink, WORKER_POLL_CAP};

const SOCKET_TOKEN: Token = Token(0);

/// Which listener this connection arrived on; gates memfd support (spec
/// §4.6 -- TCP can't carry ancillary fds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Running,
    Closed,
}

/// The two socket kinds this receiver accepts, behind one `Read`/`Write`
/// surface.
enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    fn register(&mut self, poll: &Poll) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => poll
                .registry()
                .register(s, SOCKET_TOKEN, Interest::READABLE),
            Sock::Unix(s) => poll
                .registry()
                .register(s, SOCKET_TOKEN, Interest::READABLE),
        }
    }

    fn reregister(&mut self, poll: &Poll, writable: bool) -> io::Result<()> {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self {
            Sock::Tcp(s) => poll.registry().reregister(s, SOCKET_TOKEN, interest),
            Sock::Unix(s) => poll.registry().reregister(s, SOCKET_TOKEN, interest),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Sock::Tcp(s) => s.as_raw_fd(),
            Sock::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Sock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.read(buf),
            Sock::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Sock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.write(buf),
            Sock::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.flush(),
            Sock::Unix(s) => s.flush(),
        }
    }
}

/// Shared, read-only collaborators every connection on this receiver needs.
pub struct ConnectionShared {
    pub wildcards: Arc<WildcardRegistry>,
    pub sink: Arc<dyn TimeshiftSink>,
    pub clock_source: ClockSource,
    pub require_auth_cookie: bool,
    pub expected_cookie: Option<Vec<u8>>,
}

/// One client connection: its handshake state, per-stream table, and the
/// socket it owns (spec §3 "Connection", §4.6).
pub struct Connection {
    sock: Sock,
    poll: Poll,
    transport: Transport,
    peer_identity: String,

    state: ConnectionState,
    protocol_version: u16,
    supports_shm: bool,
    supports_memfd: bool,

    shared: Arc<ConnectionShared>,

    client_props: crate::protocol::Props,
    client_name: Option<CString>,
    subscribe_mask: SubscriptionMask,

    streams: HashMap<u32, Stream>,
    next_channel: u32,
    next_sink_input_index: u32,
    next_uniquifier: u32,

    memfd_pool: MemfdPool,
    pending_fds: VecDeque<OwnedFd>,

    read_buf: Vec<u8>,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,

    stop: Arc<AtomicBool>,
}

impl Connection {
    fn new(
        sock: Sock,
        transport: Transport,
        peer_identity: String,
        shared: Arc<ConnectionShared>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let mut conn = Self {
            sock,
            poll,
            transport,
            peer_identity,
            state: ConnectionState::Unauthenticated,
            protocol_version: protocol::PROTOCOL_MIN_VERSION,
            supports_shm: false,
            supports_memfd: false,
            shared,
            client_props: crate::protocol::Props::new(),
            client_name: None,
            subscribe_mask: SubscriptionMask::empty(),
            streams: HashMap::new(),
            next_channel: 0,
            next_sink_input_index: 0,
            next_uniquifier: 0,
            memfd_pool: MemfdPool::new(),
            pending_fds: VecDeque::new(),
            read_buf: Vec::with_capacity(16 * 1024),
            write_queue: VecDeque::new(),
            write_offset: 0,
            stop,
        };
        conn.sock.register(&conn.poll)?;
        Ok(conn)
    }

    pub fn from_tcp(
        stream: std::net::TcpStream,
        peer_identity: String,
        shared: Arc<ConnectionShared>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        stream.set_nonblocking(true)?;
        Self::new(
            Sock::Tcp(TcpStream::from_std(stream)),
            Transport::Tcp,
            peer_identity,
            shared,
            stop,
        )
    }

    pub fn from_unix(
        stream: StdUnixStream,
        peer_identity: String,
        shared: Arc<ConnectionShared>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        stream.set_nonblocking(true)?;
        Self::new(
            Sock::Unix(UnixStream::from_std(stream)),
            Transport::Unix,
            peer_identity,
            shared,
            stop,
        )
    }

    pub fn peer_identity(&self) -> &str {
        &self.peer_identity
    }

    /// Drives this connection until it closes or the global stop flag is
    /// raised (spec §4.10 "Worker loop").
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut clock = self.shared.clock_source.handle();
        let mut events = Events::with_capacity(16);

        while self.state != ConnectionState::Closed && !self.stop.load(Ordering::Relaxed) {
            self.dispatch_clock_ticks(&mut clock)?;
            self.dispatch_due_requests()?;

            let writable = !self.write_queue.is_empty();
            self.sock.reregister(&self.poll, writable)?;

            let timeout = WORKER_POLL_CAP.min(Duration::from_millis(5));
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in &events {
                if event.is_error() || event.is_read_closed() {
                    self.state = ConnectionState::Closed;
                    break;
                }
                if event.is_readable() {
                    if let Err(e) = self.fill_read_buffer() {
                        log::debug!(target: "screamroute_pulse::connection", "{}: read failed: {e}", self.peer_identity);
                        self.state = ConnectionState::Closed;
                        break;
                    }
                    self.drain_frames()?;
                }
                if event.is_writable() {
                    if let Err(e) = self.flush_writes() {
                        log::debug!(target: "screamroute_pulse::connection", "{}: write failed: {e}", self.peer_identity);
                        self.state = ConnectionState::Closed;
                        break;
                    }
                }
            }
        }

        for stream in self.streams.values() {
            self.shared.wildcards.remove(&stream.wildcard_tag, &stream.composite_tag);
            self.shared.sink.reset_stream(&stream.composite_tag);
        }

        Ok(())
    }

    fn dispatch_clock_ticks(&mut self, clock: &mut ClockHandle) -> Result<(), ServerError> {
        let ticks = clock.ticks_elapsed();
        if ticks == 0 {
            return Ok(());
        }

        for _ in 0..ticks {
            let mut delivered: Vec<DeliveredChunk> = Vec::new();
            for stream in self.streams.values_mut() {
                if let ClockTick::Delivered {
                    rtp_timestamp,
                    audio,
                    play_time: _,
                } = stream.on_clock_tick()
                {
                    let channel_layout = (&stream.channel_map).into_iter().map(|p| p as u8).collect();
                    delivered.push(DeliveredChunk {
                        source_tag: stream.composite_tag.clone(),
                        sample_rate: stream.sample_spec.sample_rate,
                        channels: stream.sample_spec.channels,
                        channel_layout,
                        rtp_timestamp,
                        audio,
                    });
                }
            }

            for chunk in delivered {
                let packet = TimeshiftPacket {
                    source_tag: chunk.source_tag,
                    sample_rate: chunk.sample_rate,
                    channels: chunk.channels,
                    bit_depth: 32,
                    channel_layout: chunk.channel_layout,
                    playback_rate: 1.0,
                    audio_data: chunk.audio,
                    rtp_timestamp: chunk.rtp_timestamp,
                    received_time: Instant::now(),
                };
                self.shared.sink.push_packet(packet);
            }
        }

        Ok(())
    }

    fn dispatch_due_requests(&mut self) -> Result<(), ServerError> {
        let due: Vec<(u32, u32)> = self
            .streams
            .values_mut()
            .filter_map(|s| {
                let bytes = s.take_pending_request_bytes();
                (bytes > 0).then_some((s.stream_index, bytes))
            })
            .collect();

        for (stream_index, bytes) in due {
            self.enqueue_command(u32::MAX, &Command::Request(protocol::Request {
                channel: stream_index,
                length: bytes,
            }))?;
        }

        Ok(())
    }

    /// Reads as much as is available into `read_buf`, using `recvmsg` on
    /// the UNIX transport so ancillary fds (memfd registrations) are
    /// captured alongside the payload (spec §4.6 "Receive path").
    fn fill_read_buffer(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 64 * 1024];
        loop {
            let n = match &self.sock {
                Sock::Tcp(_) => match self.sock.read(&mut scratch) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                },
                Sock::Unix(_) => match self.recvmsg_unix(&mut scratch) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            self.read_buf.extend_from_slice(&scratch[..n]);
        }
    }

    fn recvmsg_unix(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};

        let fd = self.sock.raw_fd();
        let mut iov = [std::io::IoSliceMut::new(scratch)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);

        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let cmsgs = msg
            .cmsgs()
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw_fd in raw_fds {
                    // SAFETY: recvmsg just handed us ownership of this fd via SCM_RIGHTS.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw_fd) };
                    self.pending_fds.push_back(owned);
                }
            }
        }

        Ok(msg.bytes)
    }

    /// Consumes complete frames out of `read_buf`, dispatching command
    /// frames and stream-data frames as they become available.
    fn drain_frames(&mut self) -> Result<(), ServerError> {
        loop {
            const DESCRIPTOR_SIZE: usize = 20;
            if self.read_buf.len() < DESCRIPTOR_SIZE {
                break;
            }

            let mut cursor = io::Cursor::new(&self.read_buf[..DESCRIPTOR_SIZE]);
            let desc = protocol::read_descriptor(&mut cursor)?;
            let total = DESCRIPTOR_SIZE + desc.length as usize;
            if self.read_buf.len() < total {
                break;
            }

            let frame = self.read_buf[DESCRIPTOR_SIZE..total].to_vec();
            self.read_buf.drain(..total);

            if desc.channel == u32::MAX {
                self.handle_command_frame(&frame)?;
            } else {
                self.handle_stream_frame(desc, &frame)?;
            }
        }

        // Any ancillary fds that arrived but weren't consumed by a command
        // (e.g. RegisterMemfdShmid) stay queued for the next frame; nothing
        // to close here since they're still owned by `pending_fds`.
        Ok(())
    }

    fn handle_command_frame(&mut self, payload: &[u8]) -> Result<(), ServerError> {
        let mut cursor = io::Cursor::new(payload);
        let (seq, cmd) = match Command::read_tag_prefixed(&mut cursor, self.protocol_version) {
            Ok(v) => v,
            Err(ProtocolError::ServerError(err)) => {
                self.enqueue_error(u32::MAX, err)?;
                return Ok(());
            }
            Err(e) => {
                log::debug!(target: "screamroute_pulse::connection", "{}: malformed command: {e}", self.peer_identity);
                self.enqueue_error(u32::MAX, PulseError::Protocol)?;
                return Ok(());
            }
        };

        self.dispatch(seq, cmd)
    }

    fn handle_stream_frame(
        &mut self,
        desc: Descriptor,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        if desc.flags.contains(DescriptorFlags::SHM_DATA) && desc.flags.contains(DescriptorFlags::MEMFD_BLOCK) {
            return self.handle_memfd_block(desc, payload);
        }

        let now = Instant::now();
        let became_startable = match self.streams.get_mut(&desc.channel) {
            Some(stream) => stream.ingest(payload, now),
            None => return Ok(()),
        };

        if became_startable {
            self.enqueue_command(u32::MAX, &Command::Started(desc.channel))?;
        }

        Ok(())
    }

    fn handle_memfd_block(&mut self, desc: Descriptor, payload: &[u8]) -> Result<(), ServerError> {
        if payload.len() != 16 {
            return Err(ServerError::Protocol(ProtocolError::Invalid(
                "truncated memfd block reference".into(),
            )));
        }

        let block_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let shm_id = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let offset = u32::from_be_bytes(payload[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(payload[12..16].try_into().unwrap());

        let data = self.memfd_pool.read_block(shm_id, offset, length)?;

        let now = Instant::now();
        let became_startable = match self.streams.get_mut(&desc.channel) {
            Some(stream) => stream.ingest_memfd_block(&data, now),
            None => false,
        };

        if became_startable {
            self.enqueue_command(u32::MAX, &Command::Started(desc.channel))?;
        }

        let mut buf = Vec::new();
        protocol::write_descriptor(&mut buf, &Descriptor::shm_release(block_id))?;
        self.write_queue.push_back(buf);

        Ok(())
    }

    fn flush_writes(&mut self) -> Result<(), ServerError> {
        while let Some(front) = self.write_queue.front() {
            match self.sock.write(&front[self.write_offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.write_offset += n;
                    if self.write_offset >= front.len() {
                        self.write_queue.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(crate) fn enqueue_reply<T: CommandReply>(
        &mut self,
        seq: u32,
        reply: &T,
    ) -> Result<(), ServerError> {
        let mut buf = Vec::new();
        protocol::write_reply_message(&mut buf, seq, reply, self.protocol_version)?;
        self.write_queue.push_back(buf);
        Ok(())
    }

    pub(crate) fn enqueue_ack(&mut self, seq: u32) -> Result<(), ServerError> {
        let mut buf = Vec::new();
        protocol::write_ack_message(&mut buf, seq, self.protocol_version)?;
        self.write_queue.push_back(buf);
        Ok(())
    }

    pub(crate) fn enqueue_error(&mut self, seq: u32, error: PulseError) -> Result<(), ServerError> {
        let mut buf = Vec::new();
        protocol::write_error_message(&mut buf, seq, error, self.protocol_version)?;
        self.write_queue.push_back(buf);
        Ok(())
    }

    pub(crate) fn enqueue_command(
        &mut self,
        seq: u32,
        command: &Command,
    ) -> Result<(), ServerError> {
        let mut buf = Vec::new();
        protocol::write_command_message(&mut buf, seq, command, self.protocol_version)?;
        self.write_queue.push_back(buf);
        Ok(())
    }

    pub(crate) fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub(crate) fn transport(&self) -> Transport {
        self.transport
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn take_next_fd(&mut self) -> Option<OwnedFd> {
        self.pending_fds.pop_front()
    }

    pub(crate) fn allocate_channel(&mut self) -> u32 {
        let channel = self.next_channel;
        self.next_channel += 1;
        channel
    }

    pub(crate) fn allocate_sink_input_index(&mut self) -> u32 {
        let index = self.next_sink_input_index;
        self.next_sink_input_index += 1;
        index
    }

    pub(crate) fn allocate_uniquifier(&mut self) -> u32 {
        let uniquifier = self.next_uniquifier;
        self.next_uniquifier += 1;
        uniquifier
    }
}

struct DeliveredChunk {
    source_tag: String,
    sample_rate: u32,
    channels: u8,
    channel_layout: Vec<u8>,
    rtp_timestamp: u32,
    audio: Vec<u8>,
}

impl Connection {
    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub(crate) fn streams_mut(&mut self) -> &mut HashMap<u32, Stream> {
        &mut self.streams
    }

    pub(crate) fn streams(&self) -> &HashMap<u32, Stream> {
        &self.streams
    }

    pub(crate) fn client_props_mut(&mut self) -> &mut crate::protocol::Props {
        &mut self.client_props
    }

    pub(crate) fn client_props(&self) -> &crate::protocol::Props {
        &self.client_props
    }

    pub(crate) fn client_name_mut(&mut self) -> &mut Option<CString> {
        &mut self.client_name
    }

    pub(crate) fn client_name(&self) -> Option<&CString> {
        self.client_name.as_ref()
    }

    pub(crate) fn subscribe_mask_mut(&mut self) -> &mut SubscriptionMask {
        &mut self.subscribe_mask
    }

    pub(crate) fn subscribe_mask(&self) -> SubscriptionMask {
        self.subscribe_mask
    }

    pub(crate) fn memfd_pool_mut(&mut self) -> &mut MemfdPool {
        &mut self.memfd_pool
    }

    pub(crate) fn supports_shm(&self) -> bool {
        self.supports_shm
    }

    pub(crate) fn supports_memfd(&self) -> bool {
        self.supports_memfd
    }

    pub(crate) fn set_capabilities(&mut self, shm: bool, memfd: bool) {
        self.supports_shm = shm;
        self.supports_memfd = memfd;
    }

    pub(crate) fn set_protocol_version(&mut self, version: u16) {
        self.protocol_version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sock_token_is_stable() {
        assert_eq!(SOCKET_TOKEN, Token(0));
    }
}
