use bitfield_struct::bitfield;

use crate::{
    transport::{read_bytes, write_bytes},
    ProtocolError, ProtocolResult, Transport,
};

/// The length of a sync token on the wire, which is also the protocol word size.
pub const SYNC_PATTERN_LEN: usize = 4;
/// How many byte shifts are attempted, before giving up on finding a sync word.
pub const DEFAULT_SYNC_SCAN_LIMIT: usize = 40;

/// A sync record of the host.
///
/// Only [Self::short], [Self::byte1] and [Self::byte2] are ever transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncPattern {
    pub long: u32,
    pub short: u16,
    pub byte1: u8,
    pub byte2: u8,
}
impl SyncPattern {
    /// Returns the four bytes, which are put on the wire.
    pub const fn to_wire(&self) -> [u8; SYNC_PATTERN_LEN] {
        let short = self.short.to_le_bytes();
        [short[0], short[1], self.byte1, self.byte2]
    }
}
/// Sent by the host before a command.
pub const H2N_SYNC_PATTERN: SyncPattern = SyncPattern {
    long: 0xBBDDEEFF,
    short: 0x4321,
    byte1: 0x34,
    byte2: 0x12,
};
/// Sent by the host before it starts reading a response.
pub const H2N_CNYS_PATTERN: SyncPattern = SyncPattern {
    long: 0xBBDDEEFF,
    short: 0x8765,
    byte1: 0x78,
    byte2: 0x56,
};
/// The word the NWP puts in front of every response.
pub const N2H_SYNC_PATTERN: u32 = 0xABCDDCBA;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// A candidate sync word read from the NWP.
pub struct SyncWord {
    /// Rolling sequence number, only valid if [Self::seq_num_set] is set.
    #[bits(2)]
    pub seq_num: u8,
    pub seq_num_set: bool,
    #[bits(29)]
    pub tag: u32,
}
impl SyncWord {
    /// The sync word carrying a sequence number.
    pub const fn with_sequence(tx_seq_num: u8) -> Self {
        Self::from_bits(N2H_SYNC_PATTERN)
            .with_seq_num_set(true)
            .with_seq_num(tx_seq_num & 0b11)
    }
    /// Check if this is a sync word for the handshake round `tx_seq_num`.
    ///
    /// A word without a sequence number has to match the pattern exactly.
    pub const fn matches(self, tx_seq_num: u8) -> bool {
        if self.seq_num_set() {
            self.tag() == Self::from_bits(N2H_SYNC_PATTERN).tag()
                && self.seq_num() == tx_seq_num & 0b11
        } else {
            self.into_bits() == N2H_SYNC_PATTERN
        }
    }
    fn from_window(window: &[u8]) -> Self {
        let mut word = [0u8; SYNC_PATTERN_LEN];
        word.copy_from_slice(&window[..SYNC_PATTERN_LEN]);
        Self::from_bits(u32::from_le_bytes(word))
    }
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
/// The generic header in front of every frame.
pub struct FrameHeader {
    pub opcode: u16,
    /// The number of bytes following the header. Always a multiple of four.
    pub length: u16,
}
impl FrameHeader {
    pub const fn from_wire(bytes: [u8; 4]) -> Self {
        Self::from_bits(u32::from_le_bytes(bytes))
    }
    pub const fn to_wire(self) -> [u8; 4] {
        self.into_bits().to_le_bytes()
    }
}

/// The result of a successful sync search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocatedHeader {
    /// The matched sync word, followed by the frame header.
    pub raw: [u8; 8],
    /// Bytes, that have to be read after the body, to get the NWP back onto a word boundary.
    pub align_pad: usize,
    /// How many times the sync word was repeated by the NWP.
    pub repeated_sync: usize,
}
impl LocatedHeader {
    pub fn sync_word(&self) -> SyncWord {
        SyncWord::from_window(&self.raw[..SYNC_PATTERN_LEN])
    }
    pub fn header(&self) -> FrameHeader {
        let mut header = [0u8; 4];
        header.copy_from_slice(&self.raw[SYNC_PATTERN_LEN..]);
        FrameHeader::from_wire(header)
    }
}

/// Locates response frames in the byte stream coming from the NWP.
///
/// The bus gives us no indication, where a frame starts. After announcing the read with the
/// CNYS token, we read one word and slide a four byte window over the stream, one byte at a
/// time, until it contains the sync word. Every fourth shift the next word is fetched into the
/// upper half of the window. Once found, the bytes still missing from the following word are
/// read, repeated sync words are skipped and the remaining word is the frame header.
///
/// This also owns the handshake sequence number, which is advanced once per located header.
pub struct FrameReader {
    tx_seq_num: u8,
    scan_limit: usize,
}
impl FrameReader {
    pub const fn new(scan_limit: usize) -> Self {
        Self {
            tx_seq_num: 0,
            scan_limit,
        }
    }
    /// Returns the current sequence number.
    pub const fn tx_seq_num(&self) -> u8 {
        self.tx_seq_num
    }
    /// Find the next frame in the stream and read its header.
    ///
    /// Gives up with [ProtocolError::SyncTimeout], if no sync word was found after the configured
    /// number of shifts. The sequence number is left untouched in that case.
    pub fn locate_and_read_header<T: Transport>(
        &mut self,
        transport: &mut T,
    ) -> ProtocolResult<LocatedHeader> {
        let mut window = [0u8; 2 * SYNC_PATTERN_LEN];

        write_bytes(transport, &H2N_CNYS_PATTERN.to_wire())?;
        read_bytes(transport, &mut window[..SYNC_PATTERN_LEN])?;

        let mut attempts = 0;
        while !SyncWord::from_window(&window).matches(self.tx_seq_num) {
            if attempts % SYNC_PATTERN_LEN == 0 {
                read_bytes(transport, &mut window[SYNC_PATTERN_LEN..])?;
            }
            window.copy_within(1.., 0);
            window[2 * SYNC_PATTERN_LEN - 1] = 0;
            attempts += 1;
            // The window after the last allowed shift is never compared.
            if attempts >= self.scan_limit {
                error!("No sync word found after {} shifts.", attempts);
                return Err(ProtocolError::SyncTimeout);
            }
        }
        let mut raw = [0u8; 8];
        raw[..SYNC_PATTERN_LEN].copy_from_slice(&window[..SYNC_PATTERN_LEN]);

        let misalignment = attempts % SYNC_PATTERN_LEN;
        if misalignment > 0 {
            window.copy_within(SYNC_PATTERN_LEN.., 0);
            read_bytes(
                transport,
                &mut window[SYNC_PATTERN_LEN - misalignment..SYNC_PATTERN_LEN],
            )?;
        } else {
            read_bytes(transport, &mut window[..SYNC_PATTERN_LEN])?;
        }

        let mut repeated_sync = 0;
        while SyncWord::from_window(&window).matches(self.tx_seq_num) {
            if repeated_sync >= self.scan_limit {
                error!("NWP keeps repeating the sync word.");
                return Err(ProtocolError::SyncTimeout);
            }
            debug!("Skipping repeated sync word.");
            repeated_sync += 1;
            raw[..SYNC_PATTERN_LEN].copy_from_slice(&window[..SYNC_PATTERN_LEN]);
            read_bytes(transport, &mut window[..SYNC_PATTERN_LEN])?;
        }
        self.tx_seq_num = self.tx_seq_num.wrapping_add(1);

        raw[SYNC_PATTERN_LEN..].copy_from_slice(&window[..SYNC_PATTERN_LEN]);
        let located = LocatedHeader {
            raw,
            align_pad: (SYNC_PATTERN_LEN - misalignment) % SYNC_PATTERN_LEN,
            repeated_sync,
        };
        trace!(
            "Located header after {} shifts: opcode {:x} length {}",
            attempts,
            located.header().opcode(),
            located.header().length()
        );
        Ok(located)
    }
}
impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_SCAN_LIMIT)
    }
}
