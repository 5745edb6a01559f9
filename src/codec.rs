use crate::{
    frame::{FrameHeader, H2N_SYNC_PATTERN},
    transport::{read_bytes, write_bytes},
    ProtocolError, ProtocolResult, Transport,
};

/// The NWP only transfers whole 32 bit words.
pub const PROTOCOL_ALIGN: usize = 4;

/// Round `len` up to the next multiple of [PROTOCOL_ALIGN].
pub const fn align4(len: usize) -> usize {
    (len + PROTOCOL_ALIGN - 1) & !(PROTOCOL_ALIGN - 1)
}

/// A command for the NWP.
///
/// The engine doesn't care about the contents of the segments, it only frames them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command<'a> {
    pub opcode: u16,
    pub descriptor: &'a [u8],
    pub payload_header: Option<&'a [u8]>,
    pub payload: Option<&'a [u8]>,
}
impl<'a> Command<'a> {
    pub const fn new(opcode: u16, descriptor: &'a [u8]) -> Self {
        Self {
            opcode,
            descriptor,
            payload_header: None,
            payload: None,
        }
    }
    pub const fn with_payload_header(mut self, payload_header: &'a [u8]) -> Self {
        self.payload_header = Some(payload_header);
        self
    }
    pub const fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = Some(payload);
        self
    }
    /// The segments in the order they go on the wire.
    fn segments(&self) -> impl Iterator<Item = &'a [u8]> {
        [Some(self.descriptor), self.payload_header, self.payload]
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty())
    }
    /// The number of bytes following the frame header on the wire.
    pub fn wire_length(&self) -> ProtocolResult<u16> {
        let length = self
            .segments()
            .map(|segment| align4(segment.len()))
            .sum::<usize>();
        u16::try_from(length).map_err(|_| ProtocolError::SegmentTooLong)
    }
    pub fn header(&self) -> ProtocolResult<FrameHeader> {
        Ok(FrameHeader::new()
            .with_opcode(self.opcode)
            .with_length(self.wire_length()?))
    }
}

/// How many bytes of a response ended up in the caller's buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResponseLength {
    pub descriptor: usize,
    pub payload: usize,
}

/// The outcome of reading a response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BodyRead {
    pub received: ResponseLength,
    /// Bytes, which didn't fit into the provided buffers.
    pub drained: usize,
}

/// Write a command to the NWP.
///
/// This writes the short sync token, the frame header and then all non-empty segments, each
/// padded with zeroes to a word boundary. Every individual write is a multiple of four bytes
/// long.
pub fn write_command<T: Transport>(transport: &mut T, command: &Command<'_>) -> ProtocolResult<()> {
    let header = command.header()?;
    trace!(
        "Writing command {:x} with {} bytes.",
        command.opcode,
        header.length()
    );
    write_bytes(transport, &H2N_SYNC_PATTERN.to_wire())?;
    write_bytes(transport, &header.to_wire())?;
    for segment in command.segments() {
        let (words, tail) = segment.split_at(segment.len() & !(PROTOCOL_ALIGN - 1));
        write_bytes(transport, words)?;
        if !tail.is_empty() {
            let mut word = [0u8; PROTOCOL_ALIGN];
            word[..tail.len()].copy_from_slice(tail);
            write_bytes(transport, &word)?;
        }
    }
    Ok(())
}

/// Read a response body of `length` bytes into the provided buffers.
///
/// The descriptor is filled first, then the payload. The NWP may well send less than the
/// buffers could hold, in which case only the received part is written. Whatever exceeds both
/// buffers is drained through `scratch`, so that exactly `length` bytes are consumed.
pub(crate) fn read_response_body<T: Transport>(
    transport: &mut T,
    length: usize,
    descriptor: &mut [u8],
    payload: Option<&mut [u8]>,
    scratch: &mut [u8],
) -> ProtocolResult<BodyRead> {
    let descriptor_len = descriptor.len().min(length);
    read_bytes(transport, &mut descriptor[..descriptor_len])?;
    let mut remainder = length - descriptor_len;

    let payload_len = match payload {
        Some(payload) => {
            let payload_len = payload.len().min(remainder);
            read_bytes(transport, &mut payload[..payload_len])?;
            remainder -= payload_len;
            payload_len
        }
        None => 0,
    };
    drain(transport, remainder, scratch)?;

    Ok(BodyRead {
        received: ResponseLength {
            descriptor: descriptor_len,
            payload: payload_len,
        },
        drained: remainder,
    })
}

/// Read and discard `length` bytes.
pub(crate) fn drain<T: Transport>(
    transport: &mut T,
    mut length: usize,
    scratch: &mut [u8],
) -> ProtocolResult<()> {
    debug_assert!(!scratch.is_empty());
    while length > 0 {
        let chunk = length.min(scratch.len());
        read_bytes(transport, &mut scratch[..chunk])?;
        length -= chunk;
    }
    Ok(())
}
