//! Scripted collaborators for the unit tests.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{align4, FrameHeader, InterruptSource, Transport, N2H_SYNC_PATTERN};

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    consumed: usize,
    transfers: usize,
}

/// The read side replays queued bytes, the write side records everything.
///
/// Clones share the same wire, so a test can keep one handle while the engine owns the other.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    wire: Rc<RefCell<Wire>>,
}
#[derive(Debug, PartialEq, Eq)]
pub struct Exhausted;
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push_rx(&self, bytes: &[u8]) {
        self.wire.borrow_mut().rx.extend(bytes.iter().copied());
    }
    pub fn written(&self) -> Vec<u8> {
        self.wire.borrow().tx.clone()
    }
    pub fn remaining(&self) -> usize {
        self.wire.borrow().rx.len()
    }
    pub fn consumed(&self) -> usize {
        self.wire.borrow().consumed
    }
    pub fn transfers(&self) -> usize {
        self.wire.borrow().transfers
    }
}
impl Transport for ScriptedTransport {
    type Error = Exhausted;
    fn read(&mut self, buf: &mut [u8]) -> Result<(), Exhausted> {
        let mut wire = self.wire.borrow_mut();
        wire.transfers += 1;
        if wire.rx.len() < buf.len() {
            return Err(Exhausted);
        }
        for byte in buf.iter_mut() {
            *byte = wire.rx.pop_front().ok_or(Exhausted)?;
        }
        wire.consumed += buf.len();
        Ok(())
    }
    fn write(&mut self, buf: &[u8]) -> Result<(), Exhausted> {
        let mut wire = self.wire.borrow_mut();
        wire.transfers += 1;
        wire.tx.extend_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
pub struct IrqState {
    pub enabled: bool,
    pub enables: usize,
    pub disables: usize,
    pub clears: usize,
}
#[derive(Clone, Default)]
pub struct MockIrq {
    state: Rc<RefCell<IrqState>>,
}
impl MockIrq {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn state(&self) -> std::cell::Ref<'_, IrqState> {
        self.state.borrow()
    }
}
impl InterruptSource for MockIrq {
    fn enable(&mut self) {
        let mut state = self.state.borrow_mut();
        state.enabled = true;
        state.enables += 1;
    }
    fn disable(&mut self) {
        let mut state = self.state.borrow_mut();
        state.enabled = false;
        state.disables += 1;
    }
    fn clear(&mut self) {
        self.state.borrow_mut().clears += 1;
    }
}

/// The bare NWP sync word, as it appears on the wire.
pub fn sync_bytes() -> [u8; 4] {
    N2H_SYNC_PATTERN.to_le_bytes()
}

/// A complete response frame: sync word, header and the body padded to a word boundary.
pub fn response_frame(opcode: u16, body: &[u8]) -> Vec<u8> {
    let length = align4(body.len());
    let mut frame = sync_bytes().to_vec();
    frame.extend_from_slice(
        &FrameHeader::new()
            .with_opcode(opcode)
            .with_length(length as u16)
            .to_wire(),
    );
    frame.extend_from_slice(body);
    frame.resize(8 + length, 0);
    frame
}
