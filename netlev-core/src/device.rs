//! Device and completion queue (C2).
//!
//! One `Device` stands in for a verbs device plus its protection domain and
//! completion queue. Its notification channel is an `mio::Waker`, which is exactly
//! the same "readiness on an arbitrary fd the event loop already knows how to poll"
//! trick a real CQ's notification fd gives you - push a completion, wake the token,
//! the event loop's handler drains the queue on the next wakeup (§4.2).

use crate::reactor::EventLoop;
use crate::verbs::{CompletionSink, WorkCompletion};
use mio::{Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

struct Inner {
    queue: VecDeque<WorkCompletion>,
    waker: Waker,
}

/// Owns one completion queue. Connections created against this device share an
/// `Arc<Device>` as their `CompletionSink`; the event loop's CQ handler calls
/// `poll` to drain it.
pub struct Device {
    name: String,
    inner: Mutex<Inner>,
}

impl Device {
    /// Mints a token on `event_loop` for this device's notification channel and
    /// returns the device alongside it, ready to be handed out as a `CompletionSink`.
    /// The caller still owns registering the *handler* (what to do when woken) via
    /// `EventLoop::set_handler`, since that depends on who is polling - client or
    /// server engine.
    pub fn new(name: impl Into<String>, event_loop: &EventLoop) -> io::Result<(Arc<Device>, Token)> {
        let token = event_loop.alloc_token();
        let waker = Waker::new(event_loop.registry_for_waker(), token)?;
        let device = Arc::new(Device {
            name: name.into(),
            inner: Mutex::new(Inner { queue: VecDeque::new(), waker }),
        });
        Ok((device, token))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Polls up to `max` completions off the queue, oldest first (§4.2 "poll-then-
    /// rearm", `MAX_CQ_EVENTS_PER_WAKE`).
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        let mut inner = self.inner.lock().unwrap();
        let take = max.min(inner.queue.len());
        inner.queue.drain(..take).collect()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

impl CompletionSink for Device {
    fn push(&self, completion: WorkCompletion) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(completion);
        let _ = inner.waker.wake();
    }
}
