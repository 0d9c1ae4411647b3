//! Command dispatch: the per-command contract table that drives connection
//! state transitions and replies (spec §4.6, §4.7).
//!
//! Follows the two-tier match-guard shape of the teacher's toy
//! `examples/server.rs` `handle_command`, generalized from its two booleans
//! (`authenticated`, `props.is_some()`) to the full [`ConnectionState`]
//! machine.

use std::ffi::CString;
use std::time::Instant;

use crate::protocol::{
    self, Auth, AuthReply, CardInfo, ChannelVolume, ClientInfo, Command,
    CreatePlaybackStreamReply, FormatEncoding, FormatInfo, LookupReply, ModuleInfo,
    PlaybackLatency, PlaybackStreamParams, Props, PropsUpdateMode, PulseError, SampleInfo,
    ServerInfo, SetClientNameReply, SetPlaybackStreamBufferAttrReply, SinkInfo, SinkInputInfo,
    SourceInfo, SourceOutputInfo, StatInfo,
};

use super::connection::{Connection, ConnectionState, Transport};
use super::stream::Stream;
use super::wildcard::{base_tag, composite_tag, wildcard_tag};
use super::{
    ServerError, DEFAULT_CHUNK_BYTES, DEFAULT_MAXLENGTH, DEFAULT_PREBUF, DEFAULT_TLENGTH,
    DRIVER_NAME, MAX_CONNECTIONS, SINK_DESCRIPTION, SINK_INDEX, SINK_NAME, SOURCE_DESCRIPTION,
    SOURCE_INDEX, SOURCE_NAME,
};

/// Fills in buffer-attribute fields left at the sentinel (`0` or `u32::MAX`)
/// by the client with the receiver's defaults. Mirrors the teacher's
/// `apply_buffer_defaults`.
fn apply_buffer_defaults(attr: &mut protocol::serde::stream::BufferAttr) {
    fn is_sentinel(value: u32) -> bool {
        value == 0 || value == u32::MAX
    }

    if is_sentinel(attr.max_length) {
        attr.max_length = DEFAULT_MAXLENGTH;
    }
    if is_sentinel(attr.target_length) {
        attr.target_length = DEFAULT_TLENGTH;
    }
    if is_sentinel(attr.pre_buffering) {
        attr.pre_buffering = DEFAULT_PREBUF.min(attr.target_length);
    }
    if is_sentinel(attr.minimum_request_length) {
        attr.minimum_request_length = DEFAULT_CHUNK_BYTES;
    }
}

/// Applies a client proplist update against `target`, since [`Props`] has no
/// built-in merge semantics. `Set` discards `target`'s contents outright,
/// `Merge` only fills in keys `target` doesn't already have, `Replace` merges
/// and overwrites (PulseAudio's `pa_update_mode_t` semantics).
fn apply_props_update(target: &mut Props, mode: PropsUpdateMode, update: &Props) {
    match mode {
        PropsUpdateMode::Set => {
            let mut fresh = Props::new();
            for (key, value) in update.iter() {
                fresh.set_bytes(key, value);
            }
            *target = fresh;
        }
        PropsUpdateMode::Merge => {
            for (key, value) in update.iter() {
                if target.get_bytes(key).is_none() {
                    target.set_bytes(key, value);
                }
            }
        }
        PropsUpdateMode::Replace => {
            for (key, value) in update.iter() {
                target.set_bytes(key, value);
            }
        }
    }
}

fn client_name_from_props(props: &Props) -> Option<CString> {
    props
        .get(protocol::Prop::ApplicationName)
        .and_then(|bytes| CString::new(bytes.to_vec()).ok())
}

fn fixed_sink_info() -> SinkInfo {
    SinkInfo {
        index: SINK_INDEX,
        name: CString::new(SINK_NAME).unwrap(),
        description: Some(CString::new(SINK_DESCRIPTION).unwrap()),
        props: Props::new(),
        state: protocol::SinkState::Running,
        sample_spec: protocol::SampleSpec {
            format: protocol::SampleFormat::S32Le,
            channels: 8,
            sample_rate: 48000,
        },
        channel_map: protocol::ChannelMap::default_8ch(),
        owner_module_index: None,
        cvolume: ChannelVolume::norm(8),
        muted: false,
        monitor_source_index: Some(SOURCE_INDEX),
        monitor_source_name: Some(CString::new(SOURCE_NAME).unwrap()),
        flags: protocol::SinkFlags::DECIBEL_VOLUME,
        actual_latency: 0,
        configured_latency: 0,
        driver: Some(CString::new(DRIVER_NAME).unwrap()),
        base_volume: protocol::Volume::NORM,
        volume_steps: None,
        card_index: None,
        ports: Vec::new(),
        active_port: 0,
        formats: vec![FormatInfo::new(FormatEncoding::Pcm)],
    }
}

fn fixed_source_info() -> SourceInfo {
    SourceInfo {
        index: SOURCE_INDEX,
        name: CString::new(SOURCE_NAME).unwrap(),
        description: Some(CString::new(SOURCE_DESCRIPTION).unwrap()),
        props: Props::new(),
        state: protocol::SourceState::Running,
        sample_spec: protocol::SampleSpec {
            format: protocol::SampleFormat::S32Le,
            channels: 8,
            sample_rate: 48000,
        },
        channel_map: protocol::ChannelMap::default_8ch(),
        owner_module_index: None,
        cvolume: ChannelVolume::norm(8),
        base_volume: protocol::Volume::NORM,
        volume_steps: None,
        muted: false,
        monitor_of_sink_index: Some(SINK_INDEX),
        monitor_of_sink_name: Some(CString::new(SINK_NAME).unwrap()),
        flags: protocol::SourceFlags::empty(),
        actual_latency: 0,
        configured_latency: 0,
        driver: Some(CString::new(DRIVER_NAME).unwrap()),
        card_index: None,
        ports: Vec::new(),
        active_port: 0,
        formats: vec![FormatInfo::new(FormatEncoding::Pcm)],
    }
}

fn sink_input_info_for(stream: &Stream) -> SinkInputInfo {
    SinkInputInfo {
        index: stream.sink_input_index,
        name: stream
            .name
            .clone()
            .unwrap_or_else(|| CString::new("playback stream").unwrap()),
        owner_module_index: None,
        client_index: Some(0),
        sink_index: SINK_INDEX,
        sample_spec: stream.sample_spec,
        channel_map: stream.channel_map.clone(),
        cvolume: stream.volume,
        buffer_latency: 0,
        sink_latency: 0,
        resample_method: None,
        driver: Some(CString::new(DRIVER_NAME).unwrap()),
        props: stream.props.clone(),
        muted: stream.muted,
        corked: stream.corked,
        has_volume: true,
        volume_writable: true,
        format: FormatInfo::new(FormatEncoding::Pcm),
    }
}

impl Connection {
    /// Dispatches one fully-parsed client command, enqueuing whatever
    /// reply/error/event frames it produces.
    pub(crate) fn dispatch(&mut self, seq: u32, cmd: Command) -> Result<(), ServerError> {
        match self.state() {
            ConnectionState::Unauthenticated => {
                return match cmd {
                    Command::Auth(auth) => self.handle_auth(seq, auth),
                    _ => self.enqueue_error(seq, PulseError::AccessDenied),
                };
            }
            ConnectionState::Authenticated => {
                return match cmd {
                    Command::SetClientName(props) => self.handle_set_client_name(seq, props),
                    _ => self.enqueue_error(seq, PulseError::AccessDenied),
                };
            }
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Running => {}
        }

        match cmd {
            Command::Auth(_) | Command::SetClientName(_) => {
                self.enqueue_error(seq, PulseError::Command)
            }

            Command::Exit => {
                self.set_state(ConnectionState::Closed);
                self.enqueue_ack(seq)
            }

            Command::GetServerInfo => self.handle_get_server_info(seq),
            Command::GetSinkInfo(params) => self.handle_get_sink_info(seq, params),
            Command::GetSinkInfoList => self.handle_get_sink_info_list(seq),
            Command::GetSourceInfo(params) => self.handle_get_source_info(seq, params),
            Command::GetSourceInfoList => self.handle_get_source_info_list(seq),
            Command::LookupSink(name) => self.handle_lookup(seq, name.as_deref(), SINK_NAME, SINK_INDEX),
            Command::LookupSource(name) => {
                self.handle_lookup(seq, name.as_deref(), SOURCE_NAME, SOURCE_INDEX)
            }
            Command::Subscribe(mask) => {
                *self.subscribe_mask_mut() = mask;
                self.enqueue_ack(seq)
            }
            Command::Stat => self.enqueue_reply(seq, &StatInfo::default()),

            Command::GetClientInfo(index) => self.handle_get_client_info(seq, index),
            Command::GetClientInfoList => {
                let infos = vec![self.self_client_info()];
                self.enqueue_reply(seq, &infos)
            }

            Command::GetSinkInputInfo(index) => self.handle_get_sink_input_info(seq, index),
            Command::GetSinkInputInfoList => self.handle_get_sink_input_info_list(seq),

            Command::GetCardInfo(_) => self.enqueue_error(seq, PulseError::NoEntity),
            Command::GetCardInfoList => self.enqueue_reply(seq, &Vec::<CardInfo>::new()),
            Command::GetModuleInfo(_) => self.enqueue_error(seq, PulseError::NoEntity),
            Command::GetModuleInfoList => self.enqueue_reply(seq, &Vec::<ModuleInfo>::new()),
            Command::GetSampleInfo(_) => self.enqueue_error(seq, PulseError::NoEntity),
            Command::GetSampleInfoList => self.enqueue_reply(seq, &Vec::<SampleInfo>::new()),
            Command::GetSourceOutputInfo(_) => self.enqueue_error(seq, PulseError::NoEntity),
            Command::GetSourceOutputInfoList => {
                self.enqueue_reply(seq, &Vec::<SourceOutputInfo>::new())
            }

            Command::CreatePlaybackStream(params) => self.handle_create_playback_stream(seq, params),
            Command::DeletePlaybackStream(channel) => self.handle_delete_playback_stream(seq, channel),
            Command::CorkPlaybackStream(params) => self.handle_cork_playback_stream(seq, params),
            Command::FlushPlaybackStream(channel) => self.handle_flush_playback_stream(seq, channel),
            Command::DrainPlaybackStream(channel) => self.handle_drain_playback_stream(seq, channel),
            Command::TriggerPlaybackStream(_) | Command::PrebufPlaybackStream(_) => {
                self.enqueue_ack(seq)
            }
            Command::SetPlaybackStreamBufferAttr(params) => {
                self.handle_set_playback_stream_buffer_attr(seq, params)
            }
            Command::GetPlaybackLatency(params) => self.handle_get_playback_latency(seq, params),
            Command::SetPlaybackStreamName(params) => {
                if let Some(stream) = self.streams_mut().get_mut(&params.index) {
                    stream.name = Some(params.name);
                }
                self.enqueue_ack(seq)
            }
            Command::UpdatePlaybackStreamProplist(params) => {
                if let Some(stream) = self.streams_mut().get_mut(&params.index) {
                    apply_props_update(&mut stream.props, params.mode, &params.props);
                }
                self.enqueue_ack(seq)
            }
            Command::RemovePlaybackStreamProplist(params) => {
                if let Some(stream) = self.streams_mut().get_mut(&params.index) {
                    for key in &params.keys {
                        stream.props.remove(key);
                    }
                }
                self.enqueue_ack(seq)
            }

            Command::SetSinkInputVolume(params) => {
                if let Some(stream) = self.find_stream_by_sink_input_mut(params.index) {
                    stream.volume = params.volume;
                }
                self.enqueue_ack(seq)
            }
            Command::SetSinkInputMute(params) => {
                if let Some(stream) = self.find_stream_by_sink_input_mut(params.index) {
                    stream.muted = params.mute;
                }
                self.enqueue_ack(seq)
            }

            Command::UpdateClientProplist(params) => {
                let mut props = self.client_props().clone();
                apply_props_update(&mut props, params.mode, &params.props);
                *self.client_props_mut() = props;
                self.enqueue_ack(seq)
            }
            Command::RemoveClientProplist(keys) => {
                for key in &keys {
                    self.client_props_mut().remove(key);
                }
                self.enqueue_ack(seq)
            }

            Command::RegisterMemfdShmid(params) => self.handle_register_memfd_shmid(seq, params),

            // Admin/topology commands this receiver has nothing real to act on: parsed for
            // framing correctness, acknowledged as a no-op (spec §4.7's admin-ack bucket).
            Command::SetSinkVolume(_)
            | Command::SetSourceVolume(_)
            | Command::SetSinkMute(_)
            | Command::SetSourceMute(_)
            | Command::SetSourceOutputVolume(_)
            | Command::SetSourceOutputMute(_)
            | Command::SetDefaultSink(_)
            | Command::SetDefaultSource(_)
            | Command::SetSinkPort(_)
            | Command::SetSourcePort(_)
            | Command::SetCardProfile(_)
            | Command::SetPortLatencyOffset(_)
            | Command::MoveSinkInput(_)
            | Command::MoveSourceOutput(_)
            | Command::SuspendSink(_)
            | Command::SuspendSource(_)
            | Command::KillClient(_)
            | Command::KillSinkInput(_)
            | Command::KillSourceOutput(_)
            | Command::LoadModule(_)
            | Command::UnloadModule(_)
            | Command::ClientEvent(_)
            | Command::Noop(_) => self.enqueue_ack(seq),

            Command::Unsupported(_, error) => self.enqueue_error(seq, error),

            // Server->client-only variants never legally arrive from a client; a well-behaved
            // client won't send these, but if one does, just ack rather than tearing down.
            Command::Reply
            | Command::Request(_)
            | Command::Overflow(_)
            | Command::Underflow(_)
            | Command::PlaybackStreamKilled(_)
            | Command::RecordStreamKilled(_)
            | Command::Started(_)
            | Command::PlaybackBufferAttrChanged(_)
            | Command::SubscribeEvent(_) => self.enqueue_ack(seq),
        }
    }

    fn handle_auth(&mut self, seq: u32, auth: Auth) -> Result<(), ServerError> {
        let shared = self.shared().clone();

        if shared.require_auth_cookie {
            let expected = shared.expected_cookie.as_deref().unwrap_or(&[]);
            if auth.cookie != expected {
                return self.enqueue_error(seq, PulseError::AccessDenied);
            }
        }

        let version = auth.version.min(protocol::MAX_VERSION);
        let use_shm = version >= 13 && auth.supports_shm;
        let use_memfd =
            version >= 31 && auth.supports_memfd && self.transport() == Transport::Unix;

        self.set_protocol_version(version);
        self.set_capabilities(use_shm, use_memfd);
        self.set_state(ConnectionState::Authenticated);

        self.enqueue_reply(
            seq,
            &AuthReply {
                version,
                use_memfd,
                use_shm,
            },
        )
    }

    fn handle_set_client_name(&mut self, seq: u32, props: Props) -> Result<(), ServerError> {
        let name = client_name_from_props(&props);
        *self.client_name_mut() = name;
        *self.client_props_mut() = props;
        self.set_state(ConnectionState::Running);
        self.enqueue_reply(seq, &SetClientNameReply { client_id: 0 })
    }

    fn handle_get_server_info(&mut self, seq: u32) -> Result<(), ServerError> {
        let info = ServerInfo {
            server_name: Some(CString::new("ScreamRouter").unwrap()),
            server_version: Some(CString::new("1.0").unwrap()),
            user_name: Some(CString::new("screamrouter").unwrap()),
            host_name: Some(CString::new("localhost").unwrap()),
            sample_spec: protocol::SampleSpec {
                format: protocol::SampleFormat::S32Le,
                channels: 8,
                sample_rate: 48000,
            },
            cookie: 0,
            default_sink_name: Some(CString::new(SINK_NAME).unwrap()),
            default_source_name: Some(CString::new(SOURCE_NAME).unwrap()),
            channel_map: protocol::ChannelMap::default_8ch(),
        };
        self.enqueue_reply(seq, &info)
    }

    fn handle_get_sink_info(
        &mut self,
        seq: u32,
        params: protocol::GetSinkInfo,
    ) -> Result<(), ServerError> {
        let matches = params
            .index
            .map(|index| index == SINK_INDEX)
            .or_else(|| {
                params
                    .name
                    .as_deref()
                    .map(|name| name.to_bytes() == SINK_NAME.as_bytes())
            })
            .unwrap_or(true);

        if matches {
            self.enqueue_reply(seq, &fixed_sink_info())
        } else {
            self.enqueue_error(seq, PulseError::NoEntity)
        }
    }

    fn handle_get_sink_info_list(&mut self, seq: u32) -> Result<(), ServerError> {
        self.enqueue_reply(seq, &vec![fixed_sink_info()])
    }

    fn handle_get_source_info(
        &mut self,
        seq: u32,
        params: protocol::GetSourceInfo,
    ) -> Result<(), ServerError> {
        let matches = params
            .index
            .map(|index| index == SOURCE_INDEX)
            .or_else(|| {
                params
                    .name
                    .as_deref()
                    .map(|name| name.to_bytes() == SOURCE_NAME.as_bytes())
            })
            .unwrap_or(true);

        if matches {
            self.enqueue_reply(seq, &fixed_source_info())
        } else {
            self.enqueue_error(seq, PulseError::NoEntity)
        }
    }

    fn handle_get_source_info_list(&mut self, seq: u32) -> Result<(), ServerError> {
        self.enqueue_reply(seq, &vec![fixed_source_info()])
    }

    fn handle_lookup(
        &mut self,
        seq: u32,
        name: Option<&std::ffi::CStr>,
        fixed_name: &str,
        fixed_index: u32,
    ) -> Result<(), ServerError> {
        match name {
            Some(name) if name.to_bytes() != fixed_name.as_bytes() => {
                self.enqueue_error(seq, PulseError::NoEntity)
            }
            _ => self.enqueue_reply(seq, &LookupReply::new(fixed_index)),
        }
    }

    fn self_client_info(&self) -> ClientInfo {
        ClientInfo {
            index: 0,
            name: self
                .client_name()
                .cloned()
                .unwrap_or_else(|| CString::new("unknown").unwrap()),
            owner_module_index: None,
            driver: Some(CString::new(DRIVER_NAME).unwrap()),
            props: self.client_props().clone(),
        }
    }

    fn handle_get_client_info(&mut self, seq: u32, index: u32) -> Result<(), ServerError> {
        if index == 0 {
            let info = self.self_client_info();
            self.enqueue_reply(seq, &info)
        } else {
            self.enqueue_error(seq, PulseError::NoEntity)
        }
    }

    fn handle_get_sink_input_info(&mut self, seq: u32, index: u32) -> Result<(), ServerError> {
        let info = self
            .streams()
            .values()
            .find(|s| s.sink_input_index == index)
            .map(sink_input_info_for);

        match info {
            Some(info) => self.enqueue_reply(seq, &info),
            None => self.enqueue_error(seq, PulseError::NoEntity),
        }
    }

    fn handle_get_sink_input_info_list(&mut self, seq: u32) -> Result<(), ServerError> {
        let infos: Vec<SinkInputInfo> = self.streams().values().map(sink_input_info_for).collect();
        self.enqueue_reply(seq, &infos)
    }

    fn find_stream_by_sink_input_mut(&mut self, sink_input_index: u32) -> Option<&mut Stream> {
        self.streams_mut()
            .values_mut()
            .find(|s| s.sink_input_index == sink_input_index)
    }

    fn handle_create_playback_stream(
        &mut self,
        seq: u32,
        params: PlaybackStreamParams,
    ) -> Result<(), ServerError> {
        if params.flags.passthrough {
            return self.enqueue_error(seq, PulseError::NotSupported);
        }
        if params.channel_map.num_channels() != params.sample_spec.channels {
            return self.enqueue_error(seq, PulseError::NotSupported);
        }
        if self.streams().len() >= MAX_CONNECTIONS {
            return self.enqueue_error(seq, PulseError::TooLarge);
        }

        let sink_ok = params
            .sink_index
            .map(|index| index == SINK_INDEX)
            .or_else(|| {
                params
                    .sink_name
                    .as_deref()
                    .map(|name| name.to_bytes() == SINK_NAME.as_bytes())
            })
            .unwrap_or(true);
        if !sink_ok {
            return self.enqueue_error(seq, PulseError::NoEntity);
        }

        let mut buffer_attr = params.buffer_attr;
        apply_buffer_defaults(&mut buffer_attr);

        let channel = self.allocate_channel();
        let sink_input_index = self.allocate_sink_input_index();
        let uniquifier = self.allocate_uniquifier();

        let peer_identity = self.peer_identity().to_string();
        let program = self
            .client_props()
            .get(protocol::Prop::ApplicationProcessBinary)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .or_else(|| {
                params
                    .props
                    .get(protocol::Prop::ApplicationProcessBinary)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            })
            .or_else(|| {
                self.client_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        let base = base_tag(&peer_identity, &program);
        let wildcard = wildcard_tag(&base);
        let composite = composite_tag(&peer_identity, &program, uniquifier);

        let clock = self.shared().clock_source.handle();
        let volume = params
            .cvolume
            .unwrap_or_else(|| ChannelVolume::norm(params.sample_spec.channels as usize));
        let corked = params.flags.start_corked;

        let stream = Stream::new(
            channel,
            sink_input_index,
            params.sample_spec,
            params.channel_map.clone(),
            buffer_attr,
            volume,
            corked,
            params.props,
            composite.clone(),
            wildcard.clone(),
            base,
            DEFAULT_CHUNK_BYTES,
            clock,
        );

        let requested_bytes = stream.initial_request_bytes();
        let sample_spec = stream.sample_spec;
        let channel_map = stream.channel_map.clone();

        self.shared().wildcards.register(&wildcard, &composite);
        self.streams_mut().insert(channel, stream);

        self.enqueue_reply(
            seq,
            &CreatePlaybackStreamReply {
                channel,
                stream_index: sink_input_index,
                requested_bytes,
                buffer_attr,
                sample_spec,
                channel_map,
                stream_latency: 0,
                sink_index: SINK_INDEX,
                sink_name: Some(CString::new(SINK_NAME).unwrap()),
                suspended: false,
                format: FormatInfo::new(FormatEncoding::Pcm),
            },
        )
    }

    fn handle_delete_playback_stream(&mut self, seq: u32, channel: u32) -> Result<(), ServerError> {
        if let Some(stream) = self.streams_mut().remove(&channel) {
            self.shared()
                .wildcards
                .remove(&stream.wildcard_tag, &stream.composite_tag);
            self.shared().sink.reset_stream(&stream.composite_tag);
            self.enqueue_ack(seq)
        } else {
            self.enqueue_error(seq, PulseError::NoEntity)
        }
    }

    fn handle_cork_playback_stream(
        &mut self,
        seq: u32,
        params: protocol::CorkStreamParams,
    ) -> Result<(), ServerError> {
        let should_start = match self.streams_mut().get_mut(&params.channel) {
            Some(stream) if params.cork => {
                stream.cork();
                false
            }
            Some(stream) => stream.uncork(),
            None => return self.enqueue_error(seq, PulseError::NoEntity),
        };

        if should_start {
            self.enqueue_command(0, &Command::Started(params.channel))?;
        }

        self.enqueue_ack(seq)
    }

    fn handle_flush_playback_stream(&mut self, seq: u32, channel: u32) -> Result<(), ServerError> {
        match self.streams_mut().get_mut(&channel) {
            Some(stream) => {
                stream.flush();
                self.enqueue_ack(seq)
            }
            None => self.enqueue_error(seq, PulseError::NoEntity),
        }
    }

    fn handle_drain_playback_stream(&mut self, seq: u32, channel: u32) -> Result<(), ServerError> {
        if self.streams().contains_key(&channel) {
            self.enqueue_ack(seq)
        } else {
            self.enqueue_error(seq, PulseError::NoEntity)
        }
    }

    fn handle_set_playback_stream_buffer_attr(
        &mut self,
        seq: u32,
        params: protocol::SetPlaybackStreamBufferAttrParams,
    ) -> Result<(), ServerError> {
        let Some(stream) = self.streams_mut().get_mut(&params.index) else {
            return self.enqueue_error(seq, PulseError::NoEntity);
        };

        let mut buffer_attr = params.buffer_attr;
        apply_buffer_defaults(&mut buffer_attr);
        stream.buffer_attr = buffer_attr;

        let bytes_per_frame =
            stream.sample_spec.channels as u32 * stream.sample_spec.format.bytes_per_sample() as u32;
        let configured_sink_latency = if bytes_per_frame > 0 {
            (buffer_attr.target_length as u64 * 1_000_000)
                / (bytes_per_frame as u64 * stream.sample_spec.sample_rate as u64)
        } else {
            0
        };

        self.enqueue_reply(
            seq,
            &SetPlaybackStreamBufferAttrReply {
                buffer_attr,
                configured_sink_latency,
            },
        )
    }

    fn handle_get_playback_latency(
        &mut self,
        seq: u32,
        params: protocol::LatencyParams,
    ) -> Result<(), ServerError> {
        let Some(stream) = self.streams().get(&params.channel) else {
            return self.enqueue_error(seq, PulseError::NoEntity);
        };

        let latency = stream.playback_latency(Instant::now());
        let now = std::time::SystemTime::now();

        self.enqueue_reply(
            seq,
            &PlaybackLatency {
                sink_usec: latency.total_usec,
                source_usec: 0,
                playing: latency.running,
                local_time: now,
                remote_time: now,
                write_offset: latency.write_index_bytes,
                read_offset: latency.read_index_bytes,
                underrun_for: latency.underrun_usec,
                playing_for: latency.playing_for_usec,
            },
        )
    }

    fn handle_register_memfd_shmid(
        &mut self,
        seq: u32,
        params: protocol::RegisterMemfdShmid,
    ) -> Result<(), ServerError> {
        if !self.supports_memfd() {
            return self.enqueue_error(seq, PulseError::NotSupported);
        }

        let Some(fd) = self.take_next_fd() else {
            return self.enqueue_error(seq, PulseError::Protocol);
        };

        match self.memfd_pool_mut().register(params.shmid, fd) {
            Ok(()) => self.enqueue_ack(seq),
            Err(_) => self.enqueue_error(seq, PulseError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChannelPosition, Prop};

    #[test]
    fn apply_buffer_defaults_fills_max_fields_only() {
        let mut attr = protocol::serde::stream::BufferAttr {
            max_length: u32::MAX,
            target_length: 4096,
            pre_buffering: u32::MAX,
            minimum_request_length: u32::MAX,
            fragment_size: u32::MAX,
        };
        apply_buffer_defaults(&mut attr);

        assert_eq!(attr.max_length, DEFAULT_MAXLENGTH);
        assert_eq!(attr.target_length, 4096);
        assert_eq!(attr.minimum_request_length, DEFAULT_CHUNK_BYTES);
    }

    #[test]
    fn apply_buffer_defaults_treats_all_zero_as_sentinel() {
        let mut attr = protocol::serde::stream::BufferAttr {
            max_length: 0,
            target_length: 0,
            pre_buffering: 0,
            minimum_request_length: 0,
            fragment_size: 0,
        };
        apply_buffer_defaults(&mut attr);

        assert_eq!(attr.max_length, DEFAULT_MAXLENGTH);
        assert_eq!(attr.target_length, DEFAULT_TLENGTH);
        assert_eq!(attr.pre_buffering, DEFAULT_PREBUF.min(DEFAULT_TLENGTH));
        assert_eq!(attr.minimum_request_length, DEFAULT_CHUNK_BYTES);
    }

    #[test]
    fn props_update_set_discards_existing() {
        let mut target = Props::new();
        target.set(Prop::ApplicationName, "old");

        let mut update = Props::new();
        update.set(Prop::MediaName, "new");

        apply_props_update(&mut target, PropsUpdateMode::Set, &update);

        assert!(target.get(Prop::ApplicationName).is_none());
        assert!(target.get(Prop::MediaName).is_some());
    }

    #[test]
    fn props_update_merge_keeps_existing_value() {
        let mut target = Props::new();
        target.set(Prop::ApplicationName, "old");

        let mut update = Props::new();
        update.set(Prop::ApplicationName, "new");
        update.set(Prop::MediaName, "media");

        apply_props_update(&mut target, PropsUpdateMode::Merge, &update);

        assert_eq!(target.get(Prop::ApplicationName).unwrap(), b"old\0");
        assert!(target.get(Prop::MediaName).is_some());
    }

    #[test]
    fn props_update_replace_overwrites_existing_value() {
        let mut target = Props::new();
        target.set(Prop::ApplicationName, "old");

        let mut update = Props::new();
        update.set(Prop::ApplicationName, "new");

        apply_props_update(&mut target, PropsUpdateMode::Replace, &update);

        assert_eq!(target.get(Prop::ApplicationName).unwrap(), b"new\0");
    }

    #[test]
    fn fixed_sink_and_source_advertise_configured_names() {
        let sink = fixed_sink_info();
        let source = fixed_source_info();

        assert_eq!(sink.index, SINK_INDEX);
        assert_eq!(source.index, SOURCE_INDEX);
        assert_eq!(sink.monitor_source_index, Some(SOURCE_INDEX));
        assert_eq!(source.monitor_of_sink_index, Some(SINK_INDEX));
        assert_eq!(
            sink.channel_map.num_channels() as usize,
            sink.channel_map.into_iter().count()
        );
        let _ = ChannelPosition::FrontLeft;
    }
}
