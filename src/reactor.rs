//! The event loop.
//!
//! One thread owns every watched socket: it polls for readiness, feeds
//! the matching [`Connection`] without blocking, dispatches completed
//! ones to the worker pool, and evicts connections that miss their
//! deadline. Producer threads (the acceptor, or workers returning a
//! keep-alive socket) inject connections through a typed command queue
//! signalled via a poll waker; the queue lock is never held across a
//! socket operation.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::connection::Connection;
use crate::error::Error;
use crate::events::EventSink;
use crate::Settings;

const WAKER: Token = Token(0);

/// Receives completed connections. The reactor performs no further
/// action on a connection once it has been dispatched.
pub trait Dispatch: Send {
    fn dispatch(&self, conn: Connection);
}

impl Dispatch for mpsc::Sender<Connection> {
    fn dispatch(&self, conn: Connection) {
        // A closed pool means the server is draining; drop the connection.
        let _ = self.send(conn);
    }
}

/// Work injected by producer threads, drained on the next poll wake-up.
enum Command {
    Add(Connection),
    Clear,
    Shutdown,
}

struct Shared {
    queue: Mutex<VecDeque<Command>>,
    waker: Waker,
}

impl Shared {
    fn push(&self, cmd: Command) {
        self.queue.lock().push_back(cmd);
        // Best-effort wake; a reactor that already exited just leaves
        // the command unread.
        let _ = self.waker.wake();
    }
}

/// Producer-side handle to a running reactor.
pub struct Handle {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Handle {
    /// Stages a connection for watching. Takes effect on the next poll
    /// wake-up.
    pub fn add(&self, conn: Connection) {
        self.shared.push(Command::Add(conn));
    }

    /// Closes and drops every idle watched connection. Used while the
    /// server drains.
    pub fn clear(&self) {
        self.shared.push(Command::Clear);
    }

    /// Stops the loop and, when the reactor runs on its own thread,
    /// blocks until that thread has fully exited.
    pub fn shutdown(mut self) {
        self.shared.push(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    conns: Slab<Connection>,
    /// Slab keys ordered by deadline, earliest first.
    timeouts: Vec<usize>,
    shared: Arc<Shared>,
    pool: Box<dyn Dispatch>,
    sink: Box<dyn EventSink>,
    settings: Settings,
}

impl Reactor {
    pub fn new(
        pool: Box<dyn Dispatch>,
        sink: Box<dyn EventSink>,
        settings: Settings,
    ) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            waker,
        });
        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            conns: Slab::new(),
            timeouts: Vec::new(),
            shared,
            pool,
            sink,
            settings,
        })
    }

    /// Producer-side handle for a reactor driven on the current thread
    /// via [`run`](Reactor::run).
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
            thread: None,
        }
    }

    /// Runs the loop on the current thread until shutdown is requested
    /// or the polling primitive itself fails.
    pub fn run(mut self) -> io::Result<()> {
        self.run_internal()
    }

    /// Runs the loop on a dedicated thread. A loop that exits with an
    /// error is logged and restarted; only an explicit shutdown stops it
    /// for good.
    pub fn run_in_thread(self) -> io::Result<Handle> {
        let shared = self.shared.clone();
        let thread = thread::Builder::new()
            .name("wicket-reactor".to_string())
            .spawn(move || {
                let mut reactor = self;
                loop {
                    match reactor.run_internal() {
                        Ok(()) => break,
                        Err(e) => {
                            error!("error in reactor loop escaped: {}", e);
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
            })?;
        Ok(Handle {
            shared,
            thread: Some(thread),
        })
    }

    fn run_internal(&mut self) -> io::Result<()> {
        loop {
            let budget = self.sleep_for();
            if let Err(e) = self.poll.poll(&mut self.events, Some(budget)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut woke = false;
            let mut ready = Vec::new();
            for event in self.events.iter() {
                match event.token() {
                    WAKER => woke = true,
                    Token(t) => ready.push(t - 1),
                }
            }

            for key in ready {
                self.service(key);
            }

            if woke && self.drain_commands() {
                return Ok(());
            }

            self.sweep_timeouts();
        }
    }

    /// Advances one ready connection and settles its fate. Every failure
    /// is contained here; nothing propagates into the loop.
    fn service(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }
        // Take it off the timeout list before touching the socket so the
        // sweep can never close a connection that is being serviced.
        if self.conns[key].timeout_at().is_some() {
            self.timeouts.retain(|&k| k != key);
        }

        match self.conns[key].try_to_finish() {
            Ok(true) => {
                let conn = self.remove(key);
                self.pool.dispatch(conn);
            }
            Ok(false) => {
                // Still watched; its deadline goes back in the queue so
                // a stalled peer is eventually evicted.
                if self.conns[key].timeout_at().is_some() {
                    self.schedule_timeout(key);
                }
            }
            Err(err) => {
                let mut conn = self.remove(key);
                match &err {
                    Error::Handshake(_) => {
                        self.sink.ssl_error(
                            conn.peer_addr(),
                            conn.peer_certificate().as_deref(),
                            &err,
                        );
                    }
                    Error::HeaderTooLarge | Error::Parse(_) => {
                        conn.write_bad_request();
                        self.sink.parse_error(conn.env(), &err);
                    }
                    Error::Connection(_) => {
                        debug!("dropping connection: {}", err);
                    }
                    _ => {
                        warn!("unexpected error while feeding connection: {}", err);
                        conn.write_server_error();
                    }
                }
                conn.close();
            }
        }
    }

    /// Returns true when a shutdown command was seen.
    fn drain_commands(&mut self) -> bool {
        let drained: Vec<Command> = {
            let mut queue = self.shared.queue.lock();
            queue.drain(..).collect()
        };
        for cmd in drained {
            match cmd {
                Command::Add(conn) => self.watch(conn),
                Command::Clear => self.clear_watched(),
                Command::Shutdown => return true,
            }
        }
        false
    }

    fn watch(&mut self, conn: Connection) {
        let fd = match conn.raw_fd() {
            Some(fd) => fd,
            None => {
                debug!("refusing to watch a connection without a socket");
                return;
            }
        };
        let entry = self.conns.vacant_entry();
        let key = entry.key();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(key + 1), Interest::READABLE)
        {
            // Most likely a descriptor closed behind our back; drop it
            // rather than killing the loop.
            warn!("failed to watch connection: {}", e);
            let mut conn = conn;
            conn.close();
            return;
        }
        entry.insert(conn);
        if self.conns[key].timeout_at().is_some() {
            self.schedule_timeout(key);
        }
    }

    fn schedule_timeout(&mut self, key: usize) {
        let deadline = match self.conns[key].timeout_at() {
            Some(deadline) => deadline,
            None => return,
        };
        let conns = &self.conns;
        let pos = self.timeouts.partition_point(|&k| {
            conns
                .get(k)
                .and_then(|c| c.timeout_at())
                .map_or(true, |t| t <= deadline)
        });
        self.timeouts.insert(pos, key);
    }

    /// Evicts everything whose deadline has passed, earliest first,
    /// stopping at the first deadline still in the future. A connection
    /// that already read its header gets a 408; one that never sent a
    /// request is closed silently.
    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        while let Some(&key) = self.timeouts.first() {
            let expired = self
                .conns
                .get(key)
                .and_then(|c| c.timeout_at())
                .map_or(true, |t| t <= now);
            if !expired {
                break;
            }
            self.timeouts.remove(0);
            if self.conns.contains(key) {
                let mut conn = self.remove(key);
                if conn.in_data_phase() {
                    conn.write_timeout();
                }
                conn.close();
            }
        }
    }

    fn sleep_for(&self) -> Duration {
        match self
            .timeouts
            .first()
            .and_then(|&k| self.conns.get(k))
            .and_then(|c| c.timeout_at())
        {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => self.settings.default_sleep,
        }
    }

    fn clear_watched(&mut self) {
        self.timeouts.clear();
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            let mut conn = self.remove(key);
            conn.close();
        }
    }

    fn remove(&mut self, key: usize) -> Connection {
        let conn = self.conns.remove(key);
        if let Some(fd) = conn.raw_fd() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        conn
    }
}
