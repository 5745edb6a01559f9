use core::{cell::RefCell, marker::PhantomData};

use embassy_sync::blocking_mutex;
use embassy_time::{with_timeout, Duration};
use macro_bits::{bit, check_bit};
use portable_atomic::{AtomicU32, Ordering};

use crate::{
    codec::{self, Command, ResponseLength},
    frame::{FrameReader, DEFAULT_SYNC_SCAN_LIMIT},
    request_table::{BorrowedSlot, PendingRequest, RequestTable, SlotQueue, REQUEST_QUEUE_SIZE},
    sync::{Completion, CompletionSignal},
    DefaultRawMutex, InterruptSource, Transport,
};

/// Size of the buffer, through which unclaimed response bytes are drained.
pub const SCRATCH_BUFFER_LEN: usize = 64;
/// Set in the opcode of every response to a command. Events don't carry it.
const SYNC_RESPONSE_BIT: u16 = bit!(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The transport reported an error.
    Transport,
    /// No frame boundary was found in the response stream.
    SyncTimeout,
    /// No request slot became free in time.
    TableFull,
    /// A request for the same opcode is already pending.
    DuplicateOpcode,
    /// The NWP didn't respond in time.
    ResponseTimeout,
    /// The NWP didn't reach the expected power state in time.
    PowerSequenceTimeout,
    /// The command doesn't fit into a single frame.
    SegmentTooLong,
}
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Whether an opcode is a response to a command, or an asynchronous event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpcodeClass {
    Response,
    Event,
}
impl OpcodeClass {
    pub fn of(opcode: u16) -> Self {
        if check_bit!(opcode, SYNC_RESPONSE_BIT) {
            Self::Response
        } else {
            Self::Event
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Timing parameters of the engine.
pub struct EngineConfig {
    /// How long to wait for the response to a command.
    pub response_timeout: Duration,
    /// How long to wait for a request slot to become free.
    pub registration_timeout: Duration,
    /// How long to wait for the NWP to report, that it finished initializing.
    pub init_timeout: Duration,
    /// How long each register poll during power off may take.
    pub power_poll_timeout: Duration,
    /// The time the NWP is given to settle after being stopped.
    pub power_off_settle: Duration,
    /// How many byte shifts are attempted, while searching for a sync word.
    pub sync_scan_limit: usize,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(1),
            init_timeout: Duration::from_secs(10),
            power_poll_timeout: Duration::from_millis(100),
            power_off_settle: Duration::from_millis(1),
            sync_scan_limit: DEFAULT_SYNC_SCAN_LIMIT,
        }
    }
}

/// Where the response to a command should go.
pub struct ResponseBuffers<'a> {
    pub opcode: u16,
    pub descriptor: &'a mut [u8],
    pub payload: Option<&'a mut [u8]>,
}
impl<'a> ResponseBuffers<'a> {
    pub fn new(opcode: u16, descriptor: &'a mut [u8]) -> Self {
        Self {
            opcode,
            descriptor,
            payload: None,
        }
    }
    pub fn with_payload(mut self, payload: &'a mut [u8]) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Default)]
struct EngineStats {
    responses: AtomicU32,
    unsolicited: AtomicU32,
    overflows: AtomicU32,
    sync_timeouts: AtomicU32,
    repeated_sync: AtomicU32,
}
/// Counters for frames, which didn't go the happy path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatsSnapshot {
    /// Responses delivered to a waiting request.
    pub responses: u32,
    /// Frames nobody was waiting for.
    pub unsolicited: u32,
    /// Responses, which didn't fit into the provided buffers.
    pub overflows: u32,
    /// Failed sync searches.
    pub sync_timeouts: u32,
    /// Repetitions of the sync word, which were skipped.
    pub repeated_sync: u32,
}

struct Link<T, I> {
    transport: T,
    irq: I,
    reader: FrameReader,
    scratch: [u8; SCRATCH_BUFFER_LEN],
}

/// A registered request.
///
/// Keeps the response buffers borrowed and takes the request back out of the table once dropped,
/// so the interrupt handler can never write to buffers, that were already released.
pub(crate) struct Registration<'e, 'buf> {
    requests: &'e blocking_mutex::Mutex<DefaultRawMutex, RefCell<RequestTable>>,
    completion: &'e CompletionSignal,
    slot: BorrowedSlot<'e>,
    _buffers: PhantomData<&'buf mut [u8]>,
}
impl Drop for Registration<'_, '_> {
    fn drop(&mut self) {
        let slot = *self.slot;
        if self
            .requests
            .lock(|requests| requests.borrow_mut().remove(slot))
            .is_some()
        {
            debug!("Abandoned request in slot {}.", slot);
        }
        self.completion.reset();
    }
}

/// The protocol engine.
///
/// This owns the transport and the interrupt line, correlates responses with the commands, that
/// requested them, and wakes the waiting callers.
pub struct ProtocolEngine<T, I> {
    link: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Link<T, I>>>,
    requests: blocking_mutex::Mutex<DefaultRawMutex, RefCell<RequestTable>>,
    slot_queue: SlotQueue,
    completions: [CompletionSignal; REQUEST_QUEUE_SIZE],
    stats: EngineStats,
    config: EngineConfig,
}
impl<T: Transport, I: InterruptSource> ProtocolEngine<T, I> {
    /// Create a new engine.
    ///
    /// The interrupt line is left as it is. It's unmasked by [Self::power_on].
    pub fn new(transport: T, irq: I, config: EngineConfig) -> Self {
        trace!("Initializing protocol engine.");
        Self {
            link: blocking_mutex::Mutex::new(RefCell::new(Link {
                transport,
                irq,
                reader: FrameReader::new(config.sync_scan_limit),
                scratch: [0u8; SCRATCH_BUFFER_LEN],
            })),
            requests: blocking_mutex::Mutex::new(RefCell::new(RequestTable::new())),
            slot_queue: SlotQueue::new(),
            completions: [const { CompletionSignal::new() }; REQUEST_QUEUE_SIZE],
            stats: EngineStats::default(),
            config,
        }
    }
    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
    /// Returns the transport and the interrupt line.
    pub fn release(self) -> (T, I) {
        let link = self.link.into_inner().into_inner();
        (link.transport, link.irq)
    }
    /// Returns the current handshake sequence number.
    pub fn tx_seq_num(&self) -> u8 {
        self.link.lock(|link| link.borrow().reader.tx_seq_num())
    }
    /// Returns the number of requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock(|requests| requests.borrow().len())
    }
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            responses: self.stats.responses.load(Ordering::Relaxed),
            unsolicited: self.stats.unsolicited.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
            sync_timeouts: self.stats.sync_timeouts.load(Ordering::Relaxed),
            repeated_sync: self.stats.repeated_sync.load(Ordering::Relaxed),
        }
    }
    pub(crate) fn set_irq_enabled(&self, enabled: bool) {
        self.link.lock(|link| {
            let irq = &mut link.borrow_mut().irq;
            if enabled {
                irq.enable()
            } else {
                irq.disable()
            }
        })
    }

    /// Claim a request slot and register the buffers for the response.
    pub(crate) async fn register<'e, 'buf>(
        &'e self,
        buffers: ResponseBuffers<'buf>,
    ) -> ProtocolResult<Registration<'e, 'buf>> {
        let Ok(slot) = with_timeout(
            self.config.registration_timeout,
            self.slot_queue.wait_for_slot(),
        )
        .await
        else {
            warn!(
                "No request slot became free for opcode {:x}.",
                buffers.opcode
            );
            return Err(ProtocolError::TableFull);
        };
        let opcode = buffers.opcode;
        let completion = &self.completions[*slot];
        completion.reset();

        let request = PendingRequest::new(opcode, buffers.descriptor, buffers.payload);
        // SAFETY:
        // The registration holds the buffers for 'buf and removes the request, when it's dropped.
        let request = unsafe { request.into_static() };
        self.requests
            .lock(|requests| requests.borrow_mut().register(*slot, request))?;
        trace!("Registered opcode {:x} in slot {}.", opcode, *slot);

        Ok(Registration {
            requests: &self.requests,
            completion,
            slot,
            _buffers: PhantomData,
        })
    }
    /// Wait for the interrupt handler to complete the registered request.
    pub(crate) async fn wait_for_response(
        &self,
        registration: &Registration<'_, '_>,
        timeout: Duration,
    ) -> ProtocolResult<ResponseLength> {
        match with_timeout(timeout, registration.completion.wait()).await {
            Ok(Completion::Done(received)) => Ok(received),
            Ok(Completion::Failed(error)) => Err(error),
            Err(_) => {
                warn!(
                    "Response for slot {} timed out after {} ms.",
                    *registration.slot,
                    timeout.as_millis()
                );
                Err(ProtocolError::ResponseTimeout)
            }
        }
    }
    fn write_command(&self, command: &Command<'_>) -> ProtocolResult<()> {
        self.link
            .lock(|link| codec::write_command(&mut link.borrow_mut().transport, command))
    }

    /// Send a command to the NWP.
    ///
    /// If `response` is provided, this waits until the response with that opcode arrived and
    /// was copied into the buffers, and returns how much of them was filled. Interpreting the
    /// status inside the response is up to the caller. Without `response`, this returns as soon
    /// as the command was written.
    pub async fn send_command(
        &self,
        command: &Command<'_>,
        response: Option<ResponseBuffers<'_>>,
    ) -> ProtocolResult<ResponseLength> {
        let registration = match response {
            Some(buffers) => Some(self.register(buffers).await?),
            None => None,
        };
        self.write_command(command)?;
        let Some(registration) = registration else {
            return Ok(ResponseLength::default());
        };
        self.wait_for_response(&registration, self.config.response_timeout)
            .await
    }

    /// Process one frame from the NWP.
    ///
    /// This has to be called from the handler of the NWP interrupt. The interrupt is masked,
    /// while the frame is read. Returns the opcode of the frame.
    pub fn on_nwp_irq(&self) -> ProtocolResult<u16> {
        self.link.lock(|link| {
            let mut link = link.borrow_mut();
            link.irq.disable();
            let res = self.receive_frame(&mut link);
            link.irq.clear();
            link.irq.enable();
            res
        })
    }
    fn receive_frame(&self, link: &mut Link<T, I>) -> ProtocolResult<u16> {
        let Link {
            transport,
            reader,
            scratch,
            ..
        } = link;
        let located = match reader.locate_and_read_header(transport) {
            Ok(located) => located,
            Err(error) => {
                if error == ProtocolError::SyncTimeout {
                    self.stats.sync_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.fail_pending(error);
                return Err(error);
            }
        };
        if located.repeated_sync > 0 {
            self.stats
                .repeated_sync
                .fetch_add(located.repeated_sync as u32, Ordering::Relaxed);
        }
        let header = located.header();
        let opcode = header.opcode();
        let length = header.length() as usize;

        let resolved = self.requests.lock(|requests| {
            let mut requests = requests.borrow_mut();
            let Some((slot, request)) = requests.resolve(opcode) else {
                return codec::drain(transport, length, scratch).map(|_| None);
            };
            let (descriptor, payload) = request.buffers();
            codec::read_response_body(transport, length, descriptor, payload, scratch)
                .map(|body| Some((slot, body)))
        });
        // The request stays in the table until the frame was read completely, so a failure
        // below also reaches its waiter.
        let resolved = match resolved.and_then(|resolved| {
            codec::drain(transport, located.align_pad, scratch).map(|_| resolved)
        }) {
            Ok(resolved) => resolved,
            Err(error) => {
                self.fail_pending(error);
                return Err(error);
            }
        };

        match resolved {
            Some((slot, body)) => {
                if body.drained > 0 {
                    warn!(
                        "Response {:x} overflowed the buffers by {} bytes.",
                        opcode,
                        body.drained
                    );
                    self.stats.overflows.fetch_add(1, Ordering::Relaxed);
                }
                if self
                    .requests
                    .lock(|requests| requests.borrow_mut().remove(slot))
                    .is_some()
                {
                    self.stats.responses.fetch_add(1, Ordering::Relaxed);
                    self.completions[slot].signal(Completion::Done(body.received));
                }
            }
            None => {
                match OpcodeClass::of(opcode) {
                    OpcodeClass::Event => {
                        debug!("Drained unsolicited event {:x}.", opcode)
                    }
                    OpcodeClass::Response => {
                        warn!("Drained response {:x}, which nobody waited for.", opcode)
                    }
                }
                self.stats.unsolicited.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(opcode)
    }
    /// Complete every pending request with `error`.
    ///
    /// After a failed read the position in the stream is lost, so none of the outstanding
    /// responses can be attributed anymore.
    fn fail_pending(&self, error: ProtocolError) {
        self.requests.lock(|requests| {
            let mut requests = requests.borrow_mut();
            for (slot, completion) in self.completions.iter().enumerate() {
                if requests.remove(slot).is_some() {
                    completion.signal(Completion::Failed(error));
                }
            }
        })
    }
}
