//! Single-threaded event loop (C1, §4.1).
//!
//! One `mio::Poll` drives every registered descriptor - listener, per-connection
//! stream, per-device completion waker - from a single dedicated thread, the same
//! shape as the old `t51core::networking` reactor except rebuilt against the current
//! `mio::Registry`/`Waker` API instead of the 0.6-era `PollOpt`/`register` pair, so
//! registration can happen from any thread while only the loop thread ever calls
//! `Poll::poll`.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Handler = Box<dyn FnMut() + Send>;

struct Shared {
    handlers: Mutex<HashMap<Token, Handler>>,
    next_token: AtomicUsize,
    stop: AtomicBool,
}

/// Handle used by callers (client/server engines, devices) to register descriptors and
/// to request a shutdown; the loop itself runs on a thread spawned by `start`.
pub struct EventLoop {
    registry: mio::Registry,
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Creates the loop and spawns its dedicated thread. `poll_timeout` bounds how long
    /// a wakeup with nothing ready blocks the loop from checking the stop flag
    /// (§4.1 "bounded timeout").
    pub fn start(poll_timeout: Duration, logger: slog::Logger) -> io::Result<(Arc<EventLoop>, JoinHandle<()>)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(Shared {
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let event_loop = Arc::new(EventLoop { registry, shared: shared.clone() });
        let join = thread::spawn(move || run(poll, shared, poll_timeout, logger));
        Ok((event_loop, join))
    }

    /// Registers `source` under a freshly minted token and associates `handler`, invoked
    /// synchronously on the loop thread whenever the token becomes ready. Returns the
    /// token so the caller can `deregister` later.
    pub fn register<S: Source>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: impl FnMut() + Send + 'static,
    ) -> io::Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.registry.register(source, token, interest)?;
        self.shared.handlers.lock().unwrap().insert(token, Box::new(handler));
        Ok(token)
    }

    pub fn reregister<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    pub fn deregister<S: Source>(&self, source: &mut S, token: Token) -> io::Result<()> {
        self.registry.deregister(source)?;
        self.shared.handlers.lock().unwrap().remove(&token);
        Ok(())
    }

    /// Mints a token without registering any source for it, for callers (such as
    /// `device::Device`) that hand the token to something which registers itself
    /// internally - `mio::Waker::new` registers with the `Registry` directly rather
    /// than implementing `Source`.
    pub fn alloc_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Associates a handler with a token that was registered out-of-band (again, the
    /// `Waker` case). Panics if called twice for the same token; use `deregister` (or
    /// drop the waker and let the token go unused) to remove it first.
    pub fn set_handler(&self, token: Token, handler: impl FnMut() + Send + 'static) {
        self.shared.handlers.lock().unwrap().insert(token, Box::new(handler));
    }

    /// Exposes the cloned `Registry` for constructs like `mio::Waker::new` that take a
    /// `&Registry` directly instead of implementing `mio::event::Source`.
    pub fn registry_for_waker(&self) -> &mio::Registry {
        &self.registry
    }

    /// Signals the loop thread to exit after finishing the batch of events it is
    /// currently dispatching. Does not close any registered descriptor.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

fn run(mut poll: Poll, shared: Arc<Shared>, poll_timeout: Duration, logger: slog::Logger) {
    let mut events = Events::with_capacity(1024);
    loop {
        match poll.poll(&mut events, Some(poll_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                slog::error!(logger, "event loop poll failed"; "error" => %e);
                break;
            }
        }

        for event in &events {
            let token = event.token();
            let mut handlers = shared.handlers.lock().unwrap();
            if let Some(handler) = handlers.get_mut(&token) {
                handler();
            }
        }

        if shared.stop.load(Ordering::SeqCst) {
            slog::debug!(logger, "event loop stopping");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    #[test]
    fn registered_handler_fires_on_readiness() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (event_loop, _join) = EventLoop::start(StdDuration::from_millis(50), logger).unwrap();

        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_handler = fired.clone();

        event_loop
            .register(&mut listener, Interest::READABLE, move || {
                fired_in_handler.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        thread::sleep(StdDuration::from_millis(200));
        event_loop.stop();

        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
