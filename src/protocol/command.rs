//! Commands are the top-level IPC structure used in the protocol.

use std::ffi::CString;
use std::io::{BufRead, Write};

mod auth;
mod card_info;
mod client_event;
mod client_info;
mod extension;
mod load_module;
mod lookup;
mod module_info;
mod move_stream;
mod playback_stream;
mod playback_stream_events;
mod record_stream;
mod register_memfd_shmid;
mod sample;
mod sample_info;
mod server_info;
mod set_card_profile;
mod set_client_name;
mod set_port;
mod set_port_latency_offset;
mod sink_info;
mod sink_input_info;
mod source_info;
mod source_output_info;
mod stat;
mod subscribe;
mod suspend;
mod timing_info;
mod update_client;
mod update_stream;
mod upload_stream;
mod volume;

pub use auth::{Auth, AuthReply};
pub use card_info::*;
pub use client_event::*;
pub use client_info::*;
pub use extension::*;
pub use load_module::*;
pub use lookup::*;
pub use module_info::*;
pub use move_stream::*;
pub use playback_stream::*;
pub use playback_stream_events::*;
pub use record_stream::*;
pub use register_memfd_shmid::*;
pub use sample::*;
pub use sample_info::*;
pub use server_info::*;
pub use set_card_profile::*;
pub use set_client_name::*;
pub use set_port::*;
pub use set_port_latency_offset::*;
pub use sink_info::*;
pub use sink_input_info::*;
pub use source_info::*;
pub use source_output_info::*;
pub use stat::*;
pub use subscribe::*;
pub use suspend::*;
pub use timing_info::*;
pub use update_client::*;
pub use update_stream::*;
pub use upload_stream::*;
pub use volume::*;

use super::{serde::*, ProtocolError, PulseError};

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive as _;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum CommandTag {
    /* Generic commands */
    Error = 0,
    Timeout = 1, /* pseudo command */
    Reply = 2,   /* actually used for command replies */

    /* CLIENT->SERVER */
    CreatePlaybackStream = 3, /* Payload changed in v9, v12 (0.9.0, 0.9.8) */
    DeletePlaybackStream = 4,
    CreateRecordStream = 5, /* Payload changed in v9, v12 (0.9.0, 0.9.8) */
    DeleteRecordStream = 6,
    Exit = 7,
    Auth = 8,
    SetClientName = 9,
    LookupSink = 10,
    LookupSource = 11,
    DrainPlaybackStream = 12,
    Stat = 13,
    GetPlaybackLatency = 14,
    CreateUploadStream = 15,
    DeleteUploadStream = 16,
    FinishUploadStream = 17,
    PlaySample = 18,
    RemoveSample = 19,

    GetServerInfo = 20,
    GetSinkInfo = 21,
    GetSinkInfoList = 22,
    GetSourceInfo = 23,
    GetSourceInfoList = 24,
    GetModuleInfo = 25,
    GetModuleInfoList = 26,
    GetClientInfo = 27,
    GetClientInfoList = 28,
    GetSinkInputInfo = 29,     /* Payload changed in v11 (0.9.7) */
    GetSinkInputInfoList = 30, /* Payload changed in v11 (0.9.7) */
    GetSourceOutputInfo = 31,
    GetSourceOutputInfoList = 32,
    GetSampleInfo = 33,
    GetSampleInfoList = 34,
    Subscribe = 35,

    SetSinkVolume = 36,
    SetSinkInputVolume = 37,
    SetSourceVolume = 38,

    SetSinkMute = 39,
    SetSourceMute = 40,

    CorkPlaybackStream = 41,
    FlushPlaybackStream = 42,
    TriggerPlaybackStream = 43,

    SetDefaultSink = 44,
    SetDefaultSource = 45,

    SetPlaybackStreamName = 46,
    SetRecordStreamName = 47,

    KillClient = 48,
    KillSinkInput = 49,
    KillSourceOutput = 50,

    LoadModule = 51,
    UnloadModule = 52,

    /* Obsolete */
    AddAutoloadObsolete = 53,
    RemoveAutoloadObsolete = 54,
    GetAutoloadInfoObsolete = 55,
    GetAutoloadInfoListObsolete = 56,

    GetRecordLatency = 57,
    CorkRecordStream = 58,
    FlushRecordStream = 59,
    PrebufPlaybackStream = 60,

    /* SERVER->CLIENT */
    Request = 61,
    Overflow = 62,
    Underflow = 63,
    PlaybackStreamKilled = 64,
    RecordStreamKilled = 65,
    SubscribeEvent = 66,

    /* A few more client->server commands */

    /* Supported since protocol v10 (0.9.5) */
    MoveSinkInput = 67,
    MoveSourceOutput = 68,

    /* Supported since protocol v11 (0.9.7) */
    SetSinkInputMute = 69,

    SuspendSink = 70,
    SuspendSource = 71,

    /* Supported since protocol v12 (0.9.8) */
    SetPlaybackStreamBufferAttr = 72,
    SetRecordStreamBufferAttr = 73,

    UpdatePlaybackStreamSampleRate = 74,
    UpdateRecordStreamSampleRate = 75,

    /* SERVER->CLIENT */
    PlaybackStreamSuspended = 76,
    RecordStreamSuspended = 77,
    PlaybackStreamMoved = 78,
    RecordStreamMoved = 79,

    /* Supported since protocol v13 (0.9.11) */
    UpdateRecordStreamProplist = 80,
    UpdatePlaybackStreamProplist = 81,
    UpdateClientProplist = 82,
    RemoveRecordStreamProplist = 83,
    RemovePlaybackStreamProplist = 84,
    RemoveClientProplist = 85,

    /* SERVER->CLIENT */
    Started = 86,

    /* Supported since protocol v14 (0.9.12) */
    Extension = 87,

    /* Supported since protocol v15 (0.9.15) */
    GetCardInfo = 88,
    GetCardInfoList = 89,
    SetCardProfile = 90,

    ClientEvent = 91,
    PlaybackStreamEvent = 92,
    RecordStreamEvent = 93,

    /* SERVER->CLIENT */
    PlaybackBufferAttrChanged = 94,
    RecordBufferAttrChanged = 95,

    /* Supported since protocol v16 (0.9.16) */
    SetSinkPort = 96,
    SetSourcePort = 97,

    /* Supported since protocol v22 (1.0) */
    SetSourceOutputVolume = 98,
    SetSourceOutputMute = 99,

    /* Supported since protocol v27 (3.0) */
    SetPortLatencyOffset = 100,

    /* Supported since protocol v30 (6.0) */
    /* BOTH DIRECTIONS */
    EnableSrbchannel = 101,
    DisableSrbchannel = 102,

    /* Supported since protocol v31 (9.0)
     * BOTH DIRECTIONS */
    RegisterMemfdShmid = 103,
}

impl TagStructRead for CommandTag {
    fn read(r: &mut TagStructReader, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let v = r.read_u32()?;

        CommandTag::from_u32(v)
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid command tag: {}", v)))
    }
}

impl TagStructWrite for CommandTag {
    fn write(&self, w: &mut TagStructWriter, _protocol_version: u16) -> Result<(), ProtocolError> {
        w.write_u32(*self as u32)?;

        Ok(())
    }
}

/// A marker trait for reply data.
pub trait CommandReply: TagStructRead + TagStructWrite {}

pub struct CommandError {
    pub code: PulseError,
}

/// Parameters for removing keys from a client's or stream's proplist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePropsParams {
    /// The index of the object the removal applies to.
    pub index: u32,
    /// The keys to remove.
    pub keys: Vec<CString>,
}

impl TagStructRead for RemovePropsParams {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        let index = ts.read_u32()?;
        let mut keys = Vec::new();
        while ts.has_data_left()? {
            keys.push(ts.read_string_non_null()?);
        }
        Ok(Self { index, keys })
    }
}

impl TagStructWrite for RemovePropsParams {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.write_u32(self.index)?;
        for key in &self.keys {
            w.write_string(Some(key))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Command {
    /// A reply to some other command. If this is returned by read_tag_prefixed, the payload has
    /// yet to be read.
    Reply,

    /// Authentication request (and protocol handshake).
    Auth(Auth),

    /// Updates client properties (not just the name).
    SetClientName(Props),

    /// Create and delete streams.
    CreatePlaybackStream(PlaybackStreamParams),
    DeletePlaybackStream(u32),
    DrainPlaybackStream(u32),
    CorkPlaybackStream(CorkStreamParams),
    FlushPlaybackStream(u32),
    TriggerPlaybackStream(u32),
    PrebufPlaybackStream(u32),
    SetPlaybackStreamBufferAttr(SetPlaybackStreamBufferAttrParams),
    SetPlaybackStreamName(SetStreamNameParams),
    UpdatePlaybackStreamProplist(UpdatePropsParams),
    RemovePlaybackStreamProplist(RemovePropsParams),
    GetPlaybackLatency(LatencyParams),

    /// Graceful shutdown request.
    Exit,

    /// Tells the server which memfd pool a subsequently-received fd belongs to.
    RegisterMemfdShmid(RegisterMemfdShmid),

    /// So-called introspection commands, to read back the state of the server.
    GetServerInfo,
    GetSinkInfo(GetSinkInfo),
    GetSinkInfoList,
    GetSourceInfo(GetSourceInfo),
    GetSourceInfoList,
    GetModuleInfo(u32),
    GetModuleInfoList,
    GetClientInfo(u32),
    GetClientInfoList,
    GetSinkInputInfo(u32),
    GetSinkInputInfoList,
    GetSourceOutputInfo(u32),
    GetSourceOutputInfoList,
    GetSampleInfo(u32),
    GetSampleInfoList,
    GetCardInfo(GetCardInfo),
    GetCardInfoList,
    Stat,
    LookupSink(Option<CString>),
    LookupSource(Option<CString>),
    Subscribe(SubscriptionMask),

    SetSinkVolume(SetDeviceVolumeParams),
    SetSourceVolume(SetDeviceVolumeParams),
    SetSinkInputVolume(SetStreamVolumeParams),
    SetSourceOutputVolume(SetStreamVolumeParams),
    SetSinkMute(SetDeviceMuteParams),
    SetSourceMute(SetDeviceMuteParams),
    SetSinkInputMute(SetStreamMuteParams),
    SetSourceOutputMute(SetStreamMuteParams),

    SetDefaultSink(Option<CString>),
    SetDefaultSource(Option<CString>),

    KillClient(u32),
    KillSinkInput(u32),
    KillSourceOutput(u32),

    LoadModule(LoadModuleParams),
    UnloadModule(u32),

    SetSinkPort(SetPortParams),
    SetSourcePort(SetPortParams),
    SetCardProfile(SetCardProfileParams),
    SetPortLatencyOffset(SetPortLatencyOffsetParams),

    MoveSinkInput(MoveStreamParams),
    MoveSourceOutput(MoveStreamParams),

    SuspendSink(SuspendParams),
    SuspendSource(SuspendParams),

    UpdateClientProplist(UpdateClientProplistParams),
    RemoveClientProplist(Vec<CString>),

    ClientEvent(ClientEvent),

    /// A client->server command this receiver fully parses but has no behavior for beyond
    /// acknowledging it (a plain `Reply` is sent back).
    Noop(CommandTag),

    /// A client->server command that is rejected outright; the payload is discarded unread.
    Unsupported(CommandTag, PulseError),

    Request(Request),
    Overflow(u32),
    Underflow(Underflow),
    PlaybackStreamKilled(u32),
    RecordStreamKilled(u32),
    Started(u32),
    PlaybackBufferAttrChanged(PlaybackBufferAttrChanged),
    SubscribeEvent(SubscriptionEvent),
}

impl Command {
    pub fn read_tag_prefixed<R: BufRead>(
        r: &mut R,
        protocol_version: u16,
    ) -> Result<(u32, Self), ProtocolError> {
        let mut ts = TagStructReader::new(r, protocol_version);
        let (command, seq) = (ts.read_enum()?, ts.read_u32()?);

        let cmd = match command {
            CommandTag::Error => Err(ProtocolError::ServerError(ts.read_enum()?)),
            CommandTag::Timeout => Err(ProtocolError::Timeout),
            CommandTag::Reply => Ok(Command::Reply),

            CommandTag::Exit => Ok(Command::Exit),
            CommandTag::Auth => Ok(Command::Auth(ts.read()?)),
            CommandTag::SetClientName => {
                if protocol_version >= 13 {
                    Ok(Command::SetClientName(ts.read()?))
                } else {
                    let name = ts.read_string_non_null()?;
                    let mut props = Props::new();
                    props.set(Prop::ApplicationName, name);
                    Ok(Command::SetClientName(props))
                }
            }

            CommandTag::CreatePlaybackStream => Ok(Command::CreatePlaybackStream(ts.read()?)),
            CommandTag::DeletePlaybackStream => Ok(Command::DeletePlaybackStream(ts.read_u32()?)),
            CommandTag::CreateRecordStream => Err(ProtocolError::ServerError(PulseError::NotSupported)),
            CommandTag::DeleteRecordStream => Err(ProtocolError::ServerError(PulseError::NotSupported)),
            CommandTag::LookupSink => Ok(Command::LookupSink(ts.read_string()?)),
            CommandTag::LookupSource => Ok(Command::LookupSource(ts.read_string()?)),
            CommandTag::DrainPlaybackStream => Ok(Command::DrainPlaybackStream(ts.read_u32()?)),
            CommandTag::Stat => Ok(Command::Stat),
            CommandTag::GetPlaybackLatency => Ok(Command::GetPlaybackLatency(ts.read()?)),
            CommandTag::CreateUploadStream => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::DeleteUploadStream => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::FinishUploadStream => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::PlaySample => Err(ProtocolError::ServerError(PulseError::NotSupported)),
            CommandTag::RemoveSample => Err(ProtocolError::ServerError(PulseError::NotSupported)),

            CommandTag::GetServerInfo => Ok(Command::GetServerInfo),
            CommandTag::GetSinkInfo => Ok(Command::GetSinkInfo(ts.read()?)),
            CommandTag::GetSinkInfoList => Ok(Command::GetSinkInfoList),
            CommandTag::GetSourceInfo => Ok(Command::GetSourceInfo(ts.read()?)),
            CommandTag::GetSourceInfoList => Ok(Command::GetSourceInfoList),
            CommandTag::GetModuleInfo => Ok(Command::GetModuleInfo(ts.read_u32()?)),
            CommandTag::GetModuleInfoList => Ok(Command::GetModuleInfoList),
            CommandTag::GetClientInfo => Ok(Command::GetClientInfo(ts.read_u32()?)),
            CommandTag::GetClientInfoList => Ok(Command::GetClientInfoList),
            CommandTag::GetSinkInputInfo => Ok(Command::GetSinkInputInfo(ts.read_u32()?)),
            CommandTag::GetSinkInputInfoList => Ok(Command::GetSinkInputInfoList),
            CommandTag::GetSourceOutputInfo => Ok(Command::GetSourceOutputInfo(ts.read_u32()?)),
            CommandTag::GetSourceOutputInfoList => Ok(Command::GetSourceOutputInfoList),
            CommandTag::GetSampleInfo => Ok(Command::GetSampleInfo(ts.read_u32()?)),
            CommandTag::GetSampleInfoList => Ok(Command::GetSampleInfoList),
            CommandTag::GetCardInfo => Ok(Command::GetCardInfo(ts.read()?)),
            CommandTag::GetCardInfoList => Ok(Command::GetCardInfoList),
            CommandTag::Subscribe => Ok(Command::Subscribe(ts.read()?)),
            CommandTag::SubscribeEvent => Ok(Command::SubscribeEvent(ts.read()?)),

            CommandTag::Request => Ok(Command::Request(ts.read()?)),
            CommandTag::Overflow => Ok(Command::Overflow(ts.read_u32()?)),
            CommandTag::Underflow => Ok(Command::Underflow(ts.read()?)),
            CommandTag::PlaybackStreamKilled => Ok(Command::PlaybackStreamKilled(ts.read_u32()?)),
            CommandTag::RecordStreamKilled => Ok(Command::RecordStreamKilled(ts.read_u32()?)),
            CommandTag::Started => Ok(Command::Started(ts.read_u32()?)),
            CommandTag::PlaybackBufferAttrChanged => {
                Ok(Command::PlaybackBufferAttrChanged(ts.read()?))
            }

            CommandTag::SetSinkVolume => Ok(Command::SetSinkVolume(ts.read()?)),
            CommandTag::SetSinkInputVolume => Ok(Command::SetSinkInputVolume(ts.read()?)),
            CommandTag::SetSourceVolume => Ok(Command::SetSourceVolume(ts.read()?)),
            CommandTag::SetSinkMute => Ok(Command::SetSinkMute(ts.read()?)),
            CommandTag::SetSourceMute => Ok(Command::SetSourceMute(ts.read()?)),
            CommandTag::CorkPlaybackStream => Ok(Command::CorkPlaybackStream(ts.read()?)),
            CommandTag::FlushPlaybackStream => Ok(Command::FlushPlaybackStream(ts.read_u32()?)),
            CommandTag::TriggerPlaybackStream => {
                Ok(Command::TriggerPlaybackStream(ts.read_u32()?))
            }
            CommandTag::SetDefaultSink => Ok(Command::SetDefaultSink(ts.read_string()?)),
            CommandTag::SetDefaultSource => Ok(Command::SetDefaultSource(ts.read_string()?)),
            CommandTag::SetPlaybackStreamName => Ok(Command::SetPlaybackStreamName(ts.read()?)),
            CommandTag::SetRecordStreamName => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::KillClient => Ok(Command::KillClient(ts.read_u32()?)),
            CommandTag::KillSinkInput => Ok(Command::KillSinkInput(ts.read_u32()?)),
            CommandTag::KillSourceOutput => Ok(Command::KillSourceOutput(ts.read_u32()?)),
            CommandTag::LoadModule => Ok(Command::LoadModule(ts.read()?)),
            CommandTag::UnloadModule => Ok(Command::UnloadModule(ts.read_u32()?)),
            CommandTag::AddAutoloadObsolete => {
                Err(ProtocolError::ServerError(PulseError::Obsolete))
            }
            CommandTag::RemoveAutoloadObsolete => {
                Err(ProtocolError::ServerError(PulseError::Obsolete))
            }
            CommandTag::GetAutoloadInfoObsolete => {
                Err(ProtocolError::ServerError(PulseError::Obsolete))
            }
            CommandTag::GetAutoloadInfoListObsolete => {
                Err(ProtocolError::ServerError(PulseError::Obsolete))
            }
            CommandTag::GetRecordLatency => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::CorkRecordStream => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::FlushRecordStream => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::PrebufPlaybackStream => {
                Ok(Command::PrebufPlaybackStream(ts.read_u32()?))
            }
            CommandTag::MoveSinkInput => Ok(Command::MoveSinkInput(ts.read()?)),
            CommandTag::MoveSourceOutput => Ok(Command::MoveSourceOutput(ts.read()?)),
            CommandTag::SetSinkInputMute => Ok(Command::SetSinkInputMute(ts.read()?)),
            CommandTag::SuspendSink => Ok(Command::SuspendSink(ts.read()?)),
            CommandTag::SuspendSource => Ok(Command::SuspendSource(ts.read()?)),
            CommandTag::SetPlaybackStreamBufferAttr => {
                Ok(Command::SetPlaybackStreamBufferAttr(ts.read()?))
            }
            CommandTag::SetRecordStreamBufferAttr => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::UpdatePlaybackStreamSampleRate => Ok(Command::Noop(command)),
            CommandTag::UpdateRecordStreamSampleRate => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::PlaybackStreamSuspended => Ok(Command::Noop(command)),
            CommandTag::RecordStreamSuspended => Ok(Command::Noop(command)),
            CommandTag::PlaybackStreamMoved => Ok(Command::Noop(command)),
            CommandTag::RecordStreamMoved => Ok(Command::Noop(command)),
            CommandTag::UpdateRecordStreamProplist => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::UpdatePlaybackStreamProplist => {
                Ok(Command::UpdatePlaybackStreamProplist(ts.read()?))
            }
            CommandTag::UpdateClientProplist => Ok(Command::UpdateClientProplist(ts.read()?)),
            CommandTag::RemoveRecordStreamProplist => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::RemovePlaybackStreamProplist => {
                Ok(Command::RemovePlaybackStreamProplist(ts.read()?))
            }
            CommandTag::RemoveClientProplist => {
                let mut keys = Vec::new();
                while ts.has_data_left()? {
                    keys.push(ts.read_string_non_null()?);
                }
                Ok(Command::RemoveClientProplist(keys))
            }
            CommandTag::Extension => Err(ProtocolError::ServerError(PulseError::NoExtension)),
            CommandTag::SetCardProfile => Ok(Command::SetCardProfile(ts.read()?)),
            CommandTag::ClientEvent => Ok(Command::ClientEvent(ts.read()?)),
            CommandTag::PlaybackStreamEvent => Ok(Command::Noop(command)),
            CommandTag::RecordStreamEvent => Ok(Command::Noop(command)),

            CommandTag::RecordBufferAttrChanged => Ok(Command::Noop(command)),

            CommandTag::SetSinkPort => Ok(Command::SetSinkPort(ts.read()?)),
            CommandTag::SetSourcePort => Ok(Command::SetSourcePort(ts.read()?)),
            CommandTag::SetSourceOutputVolume => Ok(Command::SetSourceOutputVolume(ts.read()?)),
            CommandTag::SetSourceOutputMute => Ok(Command::SetSourceOutputMute(ts.read()?)),
            CommandTag::SetPortLatencyOffset => Ok(Command::SetPortLatencyOffset(ts.read()?)),
            CommandTag::EnableSrbchannel => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::DisableSrbchannel => {
                Err(ProtocolError::ServerError(PulseError::NotSupported))
            }
            CommandTag::RegisterMemfdShmid => Ok(Command::RegisterMemfdShmid(ts.read()?)),
        }?;

        Ok((seq, cmd))
    }

    pub fn write_tag_prefixed<W: Write>(
        &self,
        seq: u32,
        w: &mut W,
        protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        let mut ts = TagStructWriter::new(w, protocol_version);

        ts.write_u32(self.tag() as u32)?;
        ts.write_u32(seq)?;
        ts.write(self)?;

        Ok(())
    }

    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Reply => CommandTag::Reply,

            Command::Auth(_) => CommandTag::Auth,
            Command::SetClientName(_) => CommandTag::SetClientName,
            Command::CreatePlaybackStream(_) => CommandTag::CreatePlaybackStream,
            Command::DeletePlaybackStream(_) => CommandTag::DeletePlaybackStream,
            Command::DrainPlaybackStream(_) => CommandTag::DrainPlaybackStream,
            Command::CorkPlaybackStream(_) => CommandTag::CorkPlaybackStream,
            Command::FlushPlaybackStream(_) => CommandTag::FlushPlaybackStream,
            Command::TriggerPlaybackStream(_) => CommandTag::TriggerPlaybackStream,
            Command::PrebufPlaybackStream(_) => CommandTag::PrebufPlaybackStream,
            Command::SetPlaybackStreamBufferAttr(_) => CommandTag::SetPlaybackStreamBufferAttr,
            Command::SetPlaybackStreamName(_) => CommandTag::SetPlaybackStreamName,
            Command::UpdatePlaybackStreamProplist(_) => CommandTag::UpdatePlaybackStreamProplist,
            Command::RemovePlaybackStreamProplist(_) => CommandTag::RemovePlaybackStreamProplist,
            Command::GetPlaybackLatency(_) => CommandTag::GetPlaybackLatency,
            Command::Exit => CommandTag::Exit,
            Command::RegisterMemfdShmid(_) => CommandTag::RegisterMemfdShmid,

            Command::GetServerInfo => CommandTag::GetServerInfo,
            Command::GetSinkInfo(_) => CommandTag::GetSinkInfo,
            Command::GetSinkInfoList => CommandTag::GetSinkInfoList,
            Command::GetSourceInfo(_) => CommandTag::GetSourceInfo,
            Command::GetSourceInfoList => CommandTag::GetSourceInfoList,
            Command::GetClientInfo(_) => CommandTag::GetClientInfo,
            Command::GetClientInfoList => CommandTag::GetClientInfoList,
            Command::GetModuleInfo(_) => CommandTag::GetModuleInfo,
            Command::GetModuleInfoList => CommandTag::GetModuleInfoList,
            Command::GetSinkInputInfo(_) => CommandTag::GetSinkInputInfo,
            Command::GetSinkInputInfoList => CommandTag::GetSinkInputInfoList,
            Command::GetSourceOutputInfo(_) => CommandTag::GetSourceOutputInfo,
            Command::GetSourceOutputInfoList => CommandTag::GetSourceOutputInfoList,
            Command::GetSampleInfo(_) => CommandTag::GetSampleInfo,
            Command::GetSampleInfoList => CommandTag::GetSampleInfoList,
            Command::GetCardInfo(_) => CommandTag::GetCardInfo,
            Command::GetCardInfoList => CommandTag::GetCardInfoList,
            Command::Stat => CommandTag::Stat,
            Command::LookupSink(_) => CommandTag::LookupSink,
            Command::LookupSource(_) => CommandTag::LookupSource,
            Command::Subscribe(_) => CommandTag::Subscribe,
            Command::SubscribeEvent(_) => CommandTag::SubscribeEvent,

            Command::SetSinkVolume(_) => CommandTag::SetSinkVolume,
            Command::SetSourceVolume(_) => CommandTag::SetSourceVolume,
            Command::SetSinkInputVolume(_) => CommandTag::SetSinkInputVolume,
            Command::SetSourceOutputVolume(_) => CommandTag::SetSourceOutputVolume,
            Command::SetSinkMute(_) => CommandTag::SetSinkMute,
            Command::SetSourceMute(_) => CommandTag::SetSourceMute,
            Command::SetSinkInputMute(_) => CommandTag::SetSinkInputMute,
            Command::SetSourceOutputMute(_) => CommandTag::SetSourceOutputMute,

            Command::SetDefaultSink(_) => CommandTag::SetDefaultSink,
            Command::SetDefaultSource(_) => CommandTag::SetDefaultSource,

            Command::KillClient(_) => CommandTag::KillClient,
            Command::KillSinkInput(_) => CommandTag::KillSinkInput,
            Command::KillSourceOutput(_) => CommandTag::KillSourceOutput,

            Command::LoadModule(_) => CommandTag::LoadModule,
            Command::UnloadModule(_) => CommandTag::UnloadModule,

            Command::SetSinkPort(_) => CommandTag::SetSinkPort,
            Command::SetSourcePort(_) => CommandTag::SetSourcePort,
            Command::SetCardProfile(_) => CommandTag::SetCardProfile,
            Command::SetPortLatencyOffset(_) => CommandTag::SetPortLatencyOffset,

            Command::MoveSinkInput(_) => CommandTag::MoveSinkInput,
            Command::MoveSourceOutput(_) => CommandTag::MoveSourceOutput,

            Command::SuspendSink(_) => CommandTag::SuspendSink,
            Command::SuspendSource(_) => CommandTag::SuspendSource,

            Command::UpdateClientProplist(_) => CommandTag::UpdateClientProplist,
            Command::RemoveClientProplist(_) => CommandTag::RemoveClientProplist,

            Command::ClientEvent(_) => CommandTag::ClientEvent,

            Command::Noop(tag) => *tag,
            Command::Unsupported(tag, _) => *tag,

            Command::Request(_) => CommandTag::Request,
            Command::Overflow(_) => CommandTag::Overflow,
            Command::Underflow(_) => CommandTag::Underflow,
            Command::PlaybackStreamKilled(_) => CommandTag::PlaybackStreamKilled,
            Command::RecordStreamKilled(_) => CommandTag::RecordStreamKilled,
            Command::Started(_) => CommandTag::Started,
            Command::PlaybackBufferAttrChanged(_) => CommandTag::PlaybackBufferAttrChanged,
        }
    }
}

impl TagStructWrite for Command {
    fn write(
        &self,
        w: &mut crate::protocol::serde::TagStructWriter,
        _protocol_version: u16,
    ) -> Result<(), crate::protocol::ProtocolError> {
        match self {
            Command::Reply => Ok(()),

            Command::Auth(ref p) => w.write(p),
            Command::SetClientName(ref p) => w.write(p),
            Command::CreatePlaybackStream(ref p) => w.write(p),
            Command::DeletePlaybackStream(chan) => w.write_u32(*chan),
            Command::DrainPlaybackStream(chan) => w.write_u32(*chan),
            Command::CorkPlaybackStream(ref p) => w.write(p),
            Command::FlushPlaybackStream(chan) => w.write_u32(*chan),
            Command::TriggerPlaybackStream(chan) => w.write_u32(*chan),
            Command::PrebufPlaybackStream(chan) => w.write_u32(*chan),
            Command::SetPlaybackStreamBufferAttr(ref p) => w.write(p),
            Command::SetPlaybackStreamName(ref p) => w.write(p),
            Command::UpdatePlaybackStreamProplist(ref p) => w.write(p),
            Command::RemovePlaybackStreamProplist(ref p) => w.write(p),
            Command::GetPlaybackLatency(ref p) => w.write(p),
            Command::Exit => Ok(()),
            Command::RegisterMemfdShmid(ref p) => w.write(p),

            Command::GetSinkInfo(ref p) => w.write(p),
            Command::GetSourceInfo(ref p) => w.write(p),
            Command::GetModuleInfo(id) => w.write_u32(*id),
            Command::GetClientInfo(id) => w.write_u32(*id),
            Command::GetSinkInputInfo(id) => w.write_u32(*id),
            Command::GetSourceOutputInfo(id) => w.write_u32(*id),
            Command::GetSampleInfo(id) => w.write_u32(*id),
            Command::GetCardInfo(ref p) => w.write(p),
            Command::LookupSink(name) => w.write_string(name.as_ref()),
            Command::LookupSource(name) => w.write_string(name.as_ref()),
            Command::Subscribe(mask) => w.write(mask),
            Command::SubscribeEvent(ref p) => w.write(p),

            Command::SetSinkVolume(ref p) => w.write(p),
            Command::SetSourceVolume(ref p) => w.write(p),
            Command::SetSinkInputVolume(ref p) => w.write(p),
            Command::SetSourceOutputVolume(ref p) => w.write(p),
            Command::SetSinkMute(ref p) => w.write(p),
            Command::SetSourceMute(ref p) => w.write(p),
            Command::SetSinkInputMute(ref p) => w.write(p),
            Command::SetSourceOutputMute(ref p) => w.write(p),

            Command::SetDefaultSink(name) => w.write_string(name.as_ref()),
            Command::SetDefaultSource(name) => w.write_string(name.as_ref()),

            Command::KillClient(id) => w.write_u32(*id),
            Command::KillSinkInput(id) => w.write_u32(*id),
            Command::KillSourceOutput(id) => w.write_u32(*id),

            Command::LoadModule(ref p) => w.write(p),
            Command::UnloadModule(id) => w.write_u32(*id),

            Command::SetSinkPort(ref p) => w.write(p),
            Command::SetSourcePort(ref p) => w.write(p),
            Command::SetCardProfile(ref p) => w.write(p),
            Command::SetPortLatencyOffset(ref p) => w.write(p),

            Command::MoveSinkInput(ref p) => w.write(p),
            Command::MoveSourceOutput(ref p) => w.write(p),

            Command::SuspendSink(ref p) => w.write(p),
            Command::SuspendSource(ref p) => w.write(p),

            Command::UpdateClientProplist(ref p) => w.write(p),
            Command::RemoveClientProplist(keys) => {
                for key in keys {
                    w.write_string(Some(key))?;
                }
                Ok(())
            }

            Command::ClientEvent(ref p) => w.write(p),

            Command::Noop(_) => Ok(()),
            Command::Unsupported(_, _) => Ok(()),

            Command::Request(ref p) => w.write(p),
            Command::Overflow(chan) => w.write_u32(*chan),
            Command::Underflow(ref p) => w.write(p),
            Command::PlaybackStreamKilled(chan) => w.write_u32(*chan),
            Command::RecordStreamKilled(chan) => w.write_u32(*chan),
            Command::Started(chan) => w.write_u32(*chan),
            Command::PlaybackBufferAttrChanged(ref p) => w.write(p),
            Command::GetServerInfo
            | Command::GetSinkInfoList
            | Command::GetSourceInfoList
            | Command::GetModuleInfoList
            | Command::GetClientInfoList
            | Command::GetSinkInputInfoList
            | Command::GetSourceOutputInfoList
            | Command::GetSampleInfoList
            | Command::GetCardInfoList
            | Command::Stat => Ok(()),
        }
    }
}
