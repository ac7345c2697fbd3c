//! The non-blocking I/O reactor: a single poller thread parked on the OS
//! multiplexer via `mio`, delivering readiness back to whichever process
//! asked for it (§4.4).
//!
//! `mo-gc` has no I/O layer to generalise from, so this is grounded on
//! `mio`'s own raw-fd registration idiom (`mio::unix::SourceFd`): the VM
//! only ever hands the reactor a raw fd (from a process's `IoRead`/`IoWrite`
//! instruction), never an owned `mio` stream, so every registration wraps
//! the fd in a transient `SourceFd` for the duration of the `register` call.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// Delivers fd readiness (or a multiplexer-reported error) back to the
/// scheduler. `generation` mirrors the timer wheel's: it lets the caller
/// discard a stale delivery for a park already won by a timeout race.
pub trait ReadinessSink: Send + Sync {
    fn on_ready(&self, process_id: u64, generation: u64, fd: RawFd, error: bool);
}

struct Registration {
    process_id: u64,
    generation: u64,
    fd: RawFd,
}

struct State {
    poll: Mutex<Poll>,
    registrations: Mutex<HashMap<Token, Registration>>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
}

/// One poller thread shared by every parked process in the VM.
pub struct Reactor {
    state: Arc<State>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new(sink: Arc<dyn ReadinessSink>) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let state = Arc::new(State {
            poll: Mutex::new(poll),
            registrations: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("nimbus-reactor".into())
            .spawn(move || run(&thread_state, sink.as_ref()))
            .expect("spawning the reactor thread");

        Ok(Arc::new(Reactor {
            state,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Parks `process_id` on `fd` becoming readable (or writable), tagged
    /// with `generation`. Returns the token to pass to [`Reactor::cancel`]
    /// if a competing timeout wins first.
    pub fn register(
        &self,
        fd: RawFd,
        writable: bool,
        process_id: u64,
        generation: u64,
    ) -> io::Result<Token> {
        let token = Token(self.state.next_token.fetch_add(1, Ordering::Relaxed));
        let interest = if writable { Interest::WRITABLE } else { Interest::READABLE };

        let poll = self.state.poll.lock().expect("reactor poll mutex poisoned");
        poll.registry().register(&mut SourceFd(&fd), token, interest)?;
        drop(poll);

        self.state
            .registrations
            .lock()
            .expect("reactor registrations mutex poisoned")
            .insert(token, Registration { process_id, generation, fd });
        Ok(token)
    }

    /// Cancels a pending registration, e.g. because its timeout half of an
    /// I/O-with-timeout park fired first.
    pub fn cancel(&self, token: Token) {
        let Some(registration) = self
            .state
            .registrations
            .lock()
            .expect("reactor registrations mutex poisoned")
            .remove(&token)
        else {
            return;
        };
        let poll = self.state.poll.lock().expect("reactor poll mutex poisoned");
        let _ = poll.registry().deregister(&mut SourceFd(&registration.fd));
    }

    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().expect("reactor thread mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn run(state: &State, sink: &dyn ReadinessSink) {
    let mut events = Events::with_capacity(256);
    loop {
        if state.shutdown.load(Ordering::Acquire) {
            return;
        }

        let poll_result = {
            let mut poll = state.poll.lock().expect("reactor poll mutex poisoned");
            poll.poll(&mut events, Some(Duration::from_millis(100)))
        };
        if let Err(err) = poll_result {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::warn!(target: "nimbus_vm::reactor", "poll failed: {err}");
            continue;
        }

        for event in &events {
            let token = event.token();
            let Some(registration) = state
                .registrations
                .lock()
                .expect("reactor registrations mutex poisoned")
                .remove(&token)
            else {
                continue;
            };

            let poll = state.poll.lock().expect("reactor poll mutex poisoned");
            let _ = poll.registry().deregister(&mut SourceFd(&registration.fd));
            drop(poll);

            let error = event.is_error() || event.is_read_closed() && event.is_write_closed();
            sink.on_ready(registration.process_id, registration.generation, registration.fd, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        ready: StdMutex<Vec<(u64, u64, bool)>>,
    }

    impl ReadinessSink for RecordingSink {
        fn on_ready(&self, process_id: u64, generation: u64, _fd: RawFd, error: bool) {
            self.ready.lock().unwrap().push((process_id, generation, error));
        }
    }

    #[test]
    fn delivers_readiness_when_peer_writes() {
        let sink = Arc::new(RecordingSink { ready: StdMutex::new(Vec::new()) });
        let reactor = Reactor::new(sink.clone()).unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        reactor.register(a.as_raw_fd(), false, 42, 7).unwrap();
        b.set_nonblocking(true).unwrap();
        std::io::Write::write_all(&mut { &b }, b"hi").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.ready.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        reactor.shutdown();
        assert_eq!(*sink.ready.lock().unwrap(), vec![(42, 7, false)]);
    }

    #[test]
    fn cancel_prevents_later_delivery() {
        let sink = Arc::new(RecordingSink { ready: StdMutex::new(Vec::new()) });
        let reactor = Reactor::new(sink.clone()).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let token = reactor.register(a.as_raw_fd(), false, 1, 0).unwrap();
        reactor.cancel(token);

        std::thread::sleep(Duration::from_millis(150));
        reactor.shutdown();
        assert!(sink.ready.lock().unwrap().is_empty());
    }
}
