use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU16, AtomicU8, Ordering};

use atomic_waker::AtomicWaker;

use crate::{codec::ResponseLength, ProtocolError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    Done(ResponseLength),
    Failed(ProtocolError),
}

/// Signals the outcome of a pending request from interrupt context to the waiting task.
pub(crate) struct CompletionSignal {
    state: AtomicU8,
    descriptor_len: AtomicU16,
    payload_len: AtomicU16,
    waker: AtomicWaker,
}
impl CompletionSignal {
    const PENDING: u8 = 0;
    const DONE: u8 = 1;
    const SYNC_TIMEOUT: u8 = 2;
    const TRANSPORT: u8 = 3;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            descriptor_len: AtomicU16::new(0),
            payload_len: AtomicU16::new(0),
            waker: AtomicWaker::new(),
        }
    }
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Relaxed);
    }
    pub fn signal(&self, completion: Completion) {
        let state = match completion {
            Completion::Done(received) => {
                self.descriptor_len
                    .store(received.descriptor as u16, Ordering::Relaxed);
                self.payload_len
                    .store(received.payload as u16, Ordering::Relaxed);
                Self::DONE
            }
            Completion::Failed(ProtocolError::SyncTimeout) => Self::SYNC_TIMEOUT,
            Completion::Failed(_) => Self::TRANSPORT,
        };
        // Release, so the lengths are visible once the state is.
        self.state.store(state, Ordering::Release);
        self.waker.wake();
    }
    pub fn wait(&self) -> impl Future<Output = Completion> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            let state = self.state.load(Ordering::Acquire);
            if state == Self::PENDING {
                return Poll::Pending;
            }
            self.reset();
            Poll::Ready(match state {
                Self::DONE => Completion::Done(ResponseLength {
                    descriptor: self.descriptor_len.load(Ordering::Relaxed) as usize,
                    payload: self.payload_len.load(Ordering::Relaxed) as usize,
                }),
                Self::SYNC_TIMEOUT => Completion::Failed(ProtocolError::SyncTimeout),
                _ => Completion::Failed(ProtocolError::Transport),
            })
        })
    }
}
