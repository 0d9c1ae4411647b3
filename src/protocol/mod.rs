//! Wire framing: the fixed 20-byte descriptor and the command-message
//! envelope built on top of the tagstruct codec.

pub mod command;
pub mod serde;

mod error;

use std::io::{BufRead, Cursor, Read, Seek, SeekFrom, Write};

use bitflags::bitflags;
use byteorder::NetworkEndian;
pub use command::*;
pub use error::*;
pub use serde::{
    ChannelMap, ChannelPosition, ChannelVolume, FormatEncoding, FormatInfo, Prop, Props,
    SampleFormat, SampleSpec, Volume,
};
#[cfg(test)]
pub use serde::test_util;

/// Lowest protocol version this receiver will negotiate down to.
pub const PROTOCOL_MIN_VERSION: u16 = 13;

/// Highest protocol version this receiver will ever negotiate.
///
/// The negotiated version for a connection is `min(client_version, MAX_VERSION)`; individual
/// command payloads are then parsed/emitted with fields gated on that negotiated value, not on
/// this constant, so bumping it only ever widens what a newer client can unlock.
pub const MAX_VERSION: u16 = 35;

const DESCRIPTOR_SIZE: usize = 5 * 4;

bitflags! {
    /// Discriminant bits carried in the upper byte of a frame descriptor's flags word.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u32 {
        /// The payload is a direct SHM/memfd block reference.
        const SHM_DATA = 0x8000_0000;
        /// Pseudo-frame releasing a previously read SHM/memfd block back to the client.
        const SHM_RELEASE = 0x4000_0000;
        /// Pseudo-frame revoking a whole memfd pool.
        const SHM_REVOKE = 0xC000_0000;
        /// The referenced SHM block may be written to by the reader.
        const SHM_WRITABLE = 0x0080_0000;
        /// The SHM block is backed by a memfd (as opposed to classic SysV/POSIX shm).
        const MEMFD_BLOCK = 0x2000_0000;
    }
}

/// Selects the release/revoke/data discriminant out of a descriptor's flags.
pub const SHM_MASK: u32 = 0xFF00_0000;

/// Packet descriptor / header: the fixed 20-byte preamble of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Payload length in bytes.
    pub length: u32,
    /// The stream this packet belongs to, or `u32::MAX` for a command frame.
    pub channel: u32,
    /// High 32 bits of the SHM offset; repurposed as the released block id on SHM_RELEASE frames.
    pub offset_hi: u32,
    /// Low 32 bits of the SHM offset.
    pub offset_lo: u32,
    /// SHM_DATA/SHM_RELEASE/SHM_REVOKE/SHM_WRITABLE/MEMFD_BLOCK bits.
    pub flags: DescriptorFlags,
}

impl Descriptor {
    /// A plain command-frame descriptor carrying `length` bytes of tagstruct payload.
    pub fn command(length: u32) -> Self {
        Self {
            length,
            channel: u32::MAX,
            offset_hi: 0,
            offset_lo: 0,
            flags: DescriptorFlags::empty(),
        }
    }

    /// A zero-length `SHM_RELEASE` pseudo-frame for the given block id.
    pub fn shm_release(block_id: u32) -> Self {
        Self {
            length: 0,
            channel: u32::MAX,
            offset_hi: block_id,
            offset_lo: 0,
            flags: DescriptorFlags::SHM_RELEASE,
        }
    }
}

/// Reads one frame descriptor. Returns `Ok(None)` if fewer than 20 bytes are buffered.
pub fn read_descriptor<R: Read>(r: &mut R) -> Result<Descriptor, ProtocolError> {
    use byteorder::ReadBytesExt;

    let length = r.read_u32::<NetworkEndian>()?;
    let channel = r.read_u32::<NetworkEndian>()?;
    let offset_hi = r.read_u32::<NetworkEndian>()?;
    let offset_lo = r.read_u32::<NetworkEndian>()?;
    let flags = r.read_u32::<NetworkEndian>()?;

    Ok(Descriptor {
        length,
        channel,
        offset_hi,
        offset_lo,
        flags: DescriptorFlags::from_bits_truncate(flags),
    })
}

/// Writes one frame descriptor.
pub fn write_descriptor<W: Write>(w: &mut W, desc: &Descriptor) -> Result<(), ProtocolError> {
    use byteorder::WriteBytesExt;

    w.write_u32::<NetworkEndian>(desc.length)?;
    w.write_u32::<NetworkEndian>(desc.channel)?;
    w.write_u32::<NetworkEndian>(desc.offset_hi)?;
    w.write_u32::<NetworkEndian>(desc.offset_lo)?;
    w.write_u32::<NetworkEndian>(desc.flags.bits())?;

    Ok(())
}

/// Reads one command frame's descriptor and tagstruct body, using `protocol_version` to gate
/// version-dependent fields.
pub fn read_command_message<R: BufRead>(
    r: &mut R,
    protocol_version: u16,
) -> Result<(u32, Command), ProtocolError> {
    let desc = read_descriptor(r)?;
    Command::read_tag_prefixed(&mut r.take(desc.length as u64), protocol_version)
}

/// Reads a reply to some previously-sent request, decoding its payload as `T`.
pub fn read_reply_message<T: command::CommandReply>(
    r: &mut impl BufRead,
    protocol_version: u16,
) -> Result<(u32, T), ProtocolError> {
    let desc = read_descriptor(r)?;

    let mut r = r.take(desc.length as u64);
    let mut ts = serde::TagStructReader::new(&mut r, protocol_version);
    let (cmd, seq) = (ts.read_enum()?, ts.read_u32()?);

    match cmd {
        command::CommandTag::Error => {
            let error = ts.read_enum()?;
            Err(ProtocolError::ServerError(error))
        }
        command::CommandTag::Reply => Ok((seq, T::read(&mut ts, protocol_version)?)),
        other => Err(ProtocolError::Invalid(format!(
            "expected reply or error, got {:?}",
            other
        ))),
    }
}

/// Encodes a command message into `buf`, returning the number of bytes written.
pub fn encode_command_message<T: AsRef<[u8]>>(
    command: &Command,
    seq: u32,
    protocol_version: u16,
    buf: T,
) -> Result<usize, ProtocolError>
where
    Cursor<T>: Seek + Write,
{
    let mut cursor = Cursor::new(buf);
    cursor.seek(SeekFrom::Start(DESCRIPTOR_SIZE as u64))?;

    command.write_tag_prefixed(seq, &mut cursor, protocol_version)?;
    let length = (cursor.position() - DESCRIPTOR_SIZE as u64)
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    cursor.set_position(0);
    write_descriptor(&mut cursor, &Descriptor::command(length))?;

    Ok(cursor.position() as usize)
}

/// Writes a command message to an output stream, allocating a temporary buffer.
pub fn write_command_message<W: Write>(
    w: &mut W,
    seq: u32,
    command: &Command,
    protocol_version: u16,
) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    command.write_tag_prefixed(seq, &mut buf, protocol_version)?;

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    write_descriptor(w, &Descriptor::command(length))?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

/// Writes a reply (`Reply` tag, echoing `seq`) whose body is `reply`.
pub fn write_reply_message<W: Write, T: command::CommandReply>(
    w: &mut W,
    seq: u32,
    reply: &T,
    protocol_version: u16,
) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut ts = serde::TagStructWriter::new(&mut buf, protocol_version);
        ts.write_u32(CommandTag::Reply as u32)?;
        ts.write_u32(seq)?;
        ts.write(reply)?;
    }

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    write_descriptor(w, &Descriptor::command(length))?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

/// Writes a bare `Reply` with no payload, echoing `seq`. Used for the admin
/// commands that only need to acknowledge receipt.
pub fn write_ack_message<W: Write>(w: &mut W, seq: u32, protocol_version: u16) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut ts = serde::TagStructWriter::new(&mut buf, protocol_version);
        ts.write_u32(CommandTag::Reply as u32)?;
        ts.write_u32(seq)?;
    }

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    write_descriptor(w, &Descriptor::command(length))?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

/// Writes an `Error` reply, echoing `seq`.
pub fn write_error_message<W: Write>(
    w: &mut W,
    seq: u32,
    error: PulseError,
    protocol_version: u16,
) -> Result<(), ProtocolError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut ts = serde::TagStructWriter::new(&mut buf, protocol_version);
        ts.write_u32(CommandTag::Error as u32)?;
        ts.write_u32(seq)?;
        ts.write_u32(error as u32)?;
    }

    let length = buf
        .position()
        .try_into()
        .map_err(|_| ProtocolError::Invalid("message payload greater than 4gb".to_string()))?;

    write_descriptor(w, &Descriptor::command(length))?;
    w.write_all(buf.into_inner().as_slice())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn descriptor_roundtrip() {
        let desc = Descriptor {
            length: 1152,
            channel: 3,
            offset_hi: 9,
            offset_lo: 0,
            flags: DescriptorFlags::SHM_DATA | DescriptorFlags::MEMFD_BLOCK,
        };

        let mut buf = Vec::new();
        write_descriptor(&mut buf, &desc).unwrap();
        assert_eq!(buf.len(), DESCRIPTOR_SIZE);

        let mut cursor = Cursor::new(buf);
        let decoded = read_descriptor(&mut cursor).unwrap();
        assert_eq!(desc, decoded);
    }

    #[test]
    fn shm_release_uses_offset_hi_as_block_id() {
        let desc = Descriptor::shm_release(9);
        assert_eq!(desc.offset_hi, 9);
        assert_eq!(desc.flags, DescriptorFlags::SHM_RELEASE);
        assert_eq!(desc.flags.bits() & SHM_MASK, DescriptorFlags::SHM_RELEASE.bits());
    }

    #[test]
    fn command_message_roundtrip() {
        let mut buf = Vec::new();
        write_command_message(&mut buf, 7, &Command::GetServerInfo, MAX_VERSION).unwrap();

        let mut cursor = Cursor::new(buf);
        let (seq, cmd) = read_command_message(&mut cursor, MAX_VERSION).unwrap();
        assert_eq!(seq, 7);
        assert!(matches!(cmd, Command::GetServerInfo));
    }

    #[test]
    fn partial_frame_spanning_two_reads_is_not_consumed_early() {
        let mut full = Vec::new();
        write_command_message(&mut full, 1, &Command::GetServerInfo, MAX_VERSION).unwrap();

        // Feed only the descriptor in the first "recv call".
        let mut partial = Cursor::new(full[..DESCRIPTOR_SIZE].to_vec());
        assert!(read_command_message(&mut partial, MAX_VERSION).is_err());
    }
}
