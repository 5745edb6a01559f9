//! # `nwp-driver`
//! This is a host-side driver for the command/response protocol spoken by a wireless network
//! co-processor (NWP), which is attached over SPI and signals the host through a dedicated
//! interrupt line.
//! ## Protocol overview
//! This chapter will give a short overview of how the host and the NWP talk to each other.
//!
//! ### Commands (host to NWP)
//! Before writing anything, the host announces the write with a four byte sync token. This is
//! followed by a four byte frame header, consisting of the opcode and the length of everything
//! after the header. After that the descriptor, the optional payload header and the optional
//! payload are written. Each of these segments is padded with zeroes to a multiple of four
//! bytes, since the NWP only deals in 32 bit words.
//!
//! ### Responses (NWP to host)
//! When the NWP has something for us, it raises its interrupt line. The host then announces a
//! read with the CNYS token and starts clocking in bytes. The stream isn't framed by the bus in
//! any way, so it may start with garbage and the NWP may repeat its sync word. We therefore
//! search for the sync word byte by byte, with an upper bound on the number of attempts, skip any
//! repetitions of it and only then read the frame header. See [FrameReader] for the details.
//!
//! Once the header is known, the response is matched against the requests, which are currently
//! waiting for an answer. This is done purely by opcode, so responses to different opcodes may
//! complete in any order. The body is copied straight into the buffers provided by the waiting
//! caller. Anything, that doesn't fit into those buffers, or isn't expected by anyone, is read
//! into a small scratch buffer and discarded, so the next frame still starts on a word boundary.
//!
//! ### Concurrency
//! There are only two places from which the engine is driven: tasks calling
//! [ProtocolEngine::send_command] and the interrupt handler calling
//! [ProtocolEngine::on_nwp_irq]. All state shared between them lives behind a blocking mutex,
//! which becomes a critical section if the `critical_section` feature is enabled. A waiting
//! caller is woken through a per-request signal, instead of polling a flag. If
//! [ProtocolEngine::on_nwp_irq] is called from an actual interrupt handler, the
//! `critical_section` feature has to be enabled.
//!
//! At most [REQUEST_QUEUE_SIZE] requests can be waiting at the same time. Further callers
//! asynchronously wait for a slot to become free, which is bounded by
//! [EngineConfig::registration_timeout].
//!
//! ### Power sequencing
//! Bringing the NWP up and down uses the same machinery. Powering on waits for the
//! INIT-COMPLETE event, while powering off is a series of register polls. The register accesses
//! themselves are provided by the user through the [PowerControl] trait.

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod codec;
mod engine;
mod frame;
mod power;
mod request_table;
mod sync;
mod transport;

#[cfg(test)]
mod test_util;

pub use codec::{align4, write_command, Command, ResponseLength, PROTOCOL_ALIGN};
pub use engine::*;
pub use frame::{
    FrameHeader, FrameReader, LocatedHeader, SyncPattern, SyncWord, DEFAULT_SYNC_SCAN_LIMIT,
    H2N_CNYS_PATTERN, H2N_SYNC_PATTERN, N2H_SYNC_PATTERN, SYNC_PATTERN_LEN,
};
pub use power::{PowerControl, INIT_COMPLETE_OPCODE};
pub use request_table::REQUEST_QUEUE_SIZE;
pub use transport::{InterruptSource, SpiTransport, Transport};

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
