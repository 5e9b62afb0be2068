//! The reactor: one thread driving every session over a single multiplexer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::conn::{ConnTag, Connection};
use crate::events::{EventManager, Interest, Ready};
use crate::session::{Session, SessionId};
use crate::tls::MitmState;

/// Queue of freshly accepted client connections, shared with the acceptor.
pub type IntakeQueue = Arc<Mutex<VecDeque<Connection>>>;

pub struct Worker {
    intake: IntakeQueue,
    events: EventManager,
    sessions: HashMap<SessionId, Session>,
    mitm: Option<Arc<MitmState>>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(intake: IntakeQueue, mitm: Option<Arc<MitmState>>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            intake,
            events: EventManager::new(),
            sessions: HashMap::new(),
            mitm,
            shutdown,
        }
    }

    /// Runs reactor ticks until shutdown, then closes everything out.
    pub fn run(mut self) {
        info!("worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.tick() {
                warn!("multiplexer wait failed: {e}");
            }
        }
        self.teardown();
        info!("worker stopped");
    }

    fn tick(&mut self) -> io::Result<()> {
        self.cleanup();
        self.intake_new_connections();
        self.recompute_subscriptions();
        let ready = match self.events.wait() {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        self.dispatch(ready);
        Ok(())
    }

    /// Step 1: unregister closed connections and drop finished sessions.
    fn cleanup(&mut self) {
        let mut finished = Vec::new();
        for (id, session) in &mut self.sessions {
            for conn in session.connections_mut() {
                if conn.is_closed() && !conn.subscribed_events.is_empty() {
                    self.events.unregister(conn);
                }
            }
            if session.is_finished() {
                finished.push(*id);
            }
        }
        for id in finished {
            self.sessions.remove(&id);
            debug!(session = id, "session removed");
        }
    }

    /// Step 2: drain the intake queue; one new session per accepted client.
    fn intake_new_connections(&mut self) {
        loop {
            let conn = {
                let mut queue = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
                queue.pop_front()
            };
            let Some(mut conn) = conn else { break };
            debug!(fd = conn.id(), tag = %conn.tag, "intake");
            match conn.tag {
                ConnTag::Client => {
                    let session_id = conn.id();
                    self.events.set(&mut conn, Interest::READABLE, session_id);
                    self.sessions.insert(session_id, Session::new(conn));
                }
                ConnTag::Upstream => {
                    // Upstream connections are session-owned and picked up by
                    // the subscription recompute; nothing should land here.
                    warn!(fd = conn.id(), "unexpected upstream connection on intake queue");
                }
            }
        }
    }

    /// Step 3: desired mask per live connection — readable unless
    /// read-closed, writable while output is pending.
    fn recompute_subscriptions(&mut self) {
        for (id, session) in &mut self.sessions {
            let id = *id;
            for conn in session.connections_mut() {
                if conn.is_closed() {
                    continue;
                }
                let mut interest = Interest::NONE;
                if !conn.is_read_closed() {
                    interest = interest | Interest::READABLE;
                }
                if conn.has_pending_output() {
                    interest = interest | Interest::WRITABLE;
                }
                self.events.set(conn, interest, id);
            }
        }
        self.debug_check_subscriptions();
    }

    /// Step 5: group by session, readables before writables. Would-block is
    /// a spurious wakeup (or a TLS-layer read) and keeps the subscription;
    /// any other handler error ends that session alone.
    fn dispatch(&mut self, ready: Vec<Ready>) {
        let mut by_session: BTreeMap<SessionId, (Vec<RawFd>, Vec<RawFd>)> = BTreeMap::new();
        for event in ready {
            let entry = by_session.entry(event.session).or_default();
            if event.readable {
                entry.0.push(event.fd);
            }
            if event.writable {
                entry.1.push(event.fd);
            }
        }

        for (session_id, (readables, writables)) in by_session {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let mitm = self.mitm.as_deref();
            for fd in readables {
                if let Err(e) = session.on_readable(fd, mitm) {
                    if is_would_block(&e) {
                        continue;
                    }
                    warn!(session = session_id, "session read failed: {e:#}");
                    session.abort();
                    break;
                }
            }
            for fd in writables {
                if let Err(e) = session.on_writable(fd, mitm) {
                    if is_would_block(&e) {
                        continue;
                    }
                    warn!(session = session_id, "session write failed: {e:#}");
                    session.abort();
                    break;
                }
            }
        }
    }

    fn teardown(&mut self) {
        for session in self.sessions.values_mut() {
            for conn in session.connections_mut() {
                if !conn.subscribed_events.is_empty() {
                    self.events.unregister(conn);
                }
                if !conn.is_closed() {
                    conn.close();
                }
            }
        }
        self.sessions.clear();
    }

    /// At every tick boundary the multiplexer's registered mask must equal
    /// each connection's recorded mask.
    fn debug_check_subscriptions(&self) {
        if cfg!(debug_assertions) {
            for session in self.sessions.values() {
                for conn in session.connections() {
                    if conn.is_closed() {
                        continue;
                    }
                    let registered = self
                        .events
                        .registered_interest(conn.id())
                        .unwrap_or_default();
                    debug_assert_eq!(
                        registered,
                        conn.subscribed_events,
                        "event mask out of sync for fd {}",
                        conn.id()
                    );
                }
            }
        }
    }
}

fn is_would_block(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::WouldBlock)
}
