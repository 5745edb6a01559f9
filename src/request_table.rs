use core::{
    marker::PhantomData,
    ops::Deref,
    ptr::{null_mut, NonNull},
    slice,
};

use embassy_sync::channel::{Channel, DynamicSender};

use crate::{DefaultRawMutex, ProtocolError, ProtocolResult};

/// How many requests can wait for a response at the same time.
pub const REQUEST_QUEUE_SIZE: usize = 2;

/// A request waiting for a response with a specific opcode.
///
/// This only holds raw pointers to the caller's buffers, since it's written to from interrupt
/// context. The registration that created it keeps the buffers borrowed and removes the request
/// again before they are released.
pub(crate) struct PendingRequest<'buf> {
    expected_opcode: u16,
    descriptor: NonNull<u8>,
    descriptor_capacity: u16,
    payload: *mut u8,
    payload_capacity: u16,
    _phantom: PhantomData<&'buf mut [u8]>,
}
unsafe impl Send for PendingRequest<'_> {}
impl<'buf> PendingRequest<'buf> {
    /// Capacities beyond [u16::MAX] can never be used, since that's the maximum frame length.
    pub fn new(
        expected_opcode: u16,
        descriptor: &'buf mut [u8],
        payload: Option<&'buf mut [u8]>,
    ) -> Self {
        let (payload, payload_capacity) = match payload {
            Some(payload) => (payload.as_mut_ptr(), Self::capacity(payload)),
            None => (null_mut(), 0),
        };
        Self {
            expected_opcode,
            descriptor_capacity: Self::capacity(descriptor),
            descriptor: NonNull::from(descriptor).cast(),
            payload,
            payload_capacity,
            _phantom: PhantomData,
        }
    }
    fn capacity(buffer: &[u8]) -> u16 {
        buffer.len().min(u16::MAX as usize) as u16
    }
    pub fn expected_opcode(&self) -> u16 {
        self.expected_opcode
    }
    /// Erase the buffer lifetime, so the request can be stored in the table.
    ///
    /// SAFETY:
    /// The request has to be removed from the table, before the buffers are released.
    pub unsafe fn into_static(self) -> PendingRequest<'static> {
        PendingRequest {
            expected_opcode: self.expected_opcode,
            descriptor: self.descriptor,
            descriptor_capacity: self.descriptor_capacity,
            payload: self.payload,
            payload_capacity: self.payload_capacity,
            _phantom: PhantomData,
        }
    }
    /// Returns the descriptor and payload buffers.
    pub fn buffers(&mut self) -> (&mut [u8], Option<&mut [u8]>) {
        // SAFETY:
        // The pointers were created from exclusive borrows, which are held by the registration
        // for as long as this request is reachable.
        unsafe {
            let descriptor = slice::from_raw_parts_mut(
                self.descriptor.as_ptr(),
                self.descriptor_capacity as usize,
            );
            let payload = (!self.payload.is_null())
                .then(|| slice::from_raw_parts_mut(self.payload, self.payload_capacity as usize));
            (descriptor, payload)
        }
    }
}

/// The requests currently waiting for a response, indexed by slot.
///
/// Slots are handed out by the [SlotQueue], so every slot has at most one owner.
pub(crate) struct RequestTable {
    slots: [Option<PendingRequest<'static>>; REQUEST_QUEUE_SIZE],
    count: usize,
}
impl RequestTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; REQUEST_QUEUE_SIZE],
            count: 0,
        }
    }
    /// Store `request` in `slot`.
    ///
    /// Only one request per opcode may be pending, since a response couldn't be attributed
    /// otherwise.
    pub fn register(
        &mut self,
        slot: usize,
        request: PendingRequest<'static>,
    ) -> ProtocolResult<()> {
        if self.slots.iter().flatten().any(|pending| {
            pending.expected_opcode() == request.expected_opcode()
        }) {
            warn!(
                "A request for opcode {:x} is already pending.",
                request.expected_opcode()
            );
            return Err(ProtocolError::DuplicateOpcode);
        }
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(request);
        self.count += 1;
        Ok(())
    }
    /// Find the request waiting for `opcode`.
    pub fn resolve(&mut self, opcode: u16) -> Option<(usize, &mut PendingRequest<'static>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find_map(|(slot, pending)| {
                pending
                    .as_mut()
                    .filter(|pending| pending.expected_opcode() == opcode)
                    .map(|pending| (slot, pending))
            })
    }
    /// Remove the request in `slot`, if there is one.
    pub fn remove(&mut self, slot: usize) -> Option<PendingRequest<'static>> {
        let removed = self.slots[slot].take();
        if removed.is_some() {
            self.count -= 1;
        }
        removed
    }
    /// Returns the number of pending requests.
    pub fn len(&self) -> usize {
        self.count
    }
}

/// Ownership of one index into the [RequestTable].
///
/// Only the holder may register a request under this index. The index goes back to the
/// [SlotQueue] when this is dropped.
pub(crate) struct BorrowedSlot<'a> {
    release: DynamicSender<'a, usize>,
    index: usize,
}
impl Deref for BorrowedSlot<'_> {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.index
    }
}
impl Drop for BorrowedSlot<'_> {
    fn drop(&mut self) {
        // Every index in circulation came out of the channel, so there is always room to put it
        // back.
        let _ = self.release.try_send(self.index);
        trace!("Released request slot {}.", self.index);
    }
}
/// The free indices of the [RequestTable].
///
/// Registration awaits an index from here, which bounds the number of outstanding requests
/// without spinning.
pub(crate) struct SlotQueue {
    free: Channel<DefaultRawMutex, usize, REQUEST_QUEUE_SIZE>,
}
impl SlotQueue {
    pub fn new() -> Self {
        let free: Channel<DefaultRawMutex, usize, REQUEST_QUEUE_SIZE> = Channel::new();
        for index in 0..REQUEST_QUEUE_SIZE {
            let _ = free.try_send(index);
        }
        Self { free }
    }
    /// Wait until a request slot is free and claim it.
    pub async fn wait_for_slot(&self) -> BorrowedSlot<'_> {
        let index = self.free.receive().await;
        BorrowedSlot {
            release: self.free.dyn_sender(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use core::task::Poll;

    use embassy_futures::{block_on, poll_once};

    use super::*;

    fn request(opcode: u16, descriptor: &mut [u8]) -> PendingRequest<'static> {
        unsafe { PendingRequest::new(opcode, descriptor, None).into_static() }
    }

    #[test]
    fn register_resolve_remove() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 8];
        let mut table = RequestTable::new();
        table.register(0, request(0x0c80, &mut a)).unwrap();
        table.register(1, request(0x1401, &mut b)).unwrap();
        assert_eq!(table.len(), 2);

        let (slot, pending) = table.resolve(0x1401).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(pending.buffers().0.len(), 8);
        assert!(pending.buffers().1.is_none());
        assert!(table.resolve(0x0008).is_none());

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.resolve(0x1401).is_none());
    }

    #[test]
    fn duplicate_opcode_is_rejected() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut table = RequestTable::new();
        table.register(0, request(0x0c80, &mut a)).unwrap();
        assert_eq!(
            table.register(1, request(0x0c80, &mut b)),
            Err(ProtocolError::DuplicateOpcode)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn payload_buffer_is_exposed() {
        let mut descriptor = [0u8; 4];
        let mut payload = [0u8; 32];
        let mut request = PendingRequest::new(0x0c80, &mut descriptor, Some(&mut payload));
        let (_, exposed) = request.buffers();
        exposed.unwrap()[0] = 7;
        drop(request);
        assert_eq!(payload[0], 7);
    }

    #[test]
    fn slots_are_returned_on_drop() {
        let queue = SlotQueue::new();
        let first = block_on(queue.wait_for_slot());
        let second = block_on(queue.wait_for_slot());
        assert_ne!(*first, *second);
        assert!(matches!(poll_once(queue.wait_for_slot()), Poll::Pending));

        let freed = *second;
        drop(second);
        assert_eq!(*block_on(queue.wait_for_slot()), freed);
    }
}
