//! Level-triggered readiness multiplexing over `poll(2)`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::conn::Connection;
use crate::session::SessionId;

/// Upper bound for a single multiplexer wait. Bounds the latency between a
/// connection landing on the intake queue and the worker picking it up.
pub const WAIT_TIMEOUT_MS: u16 = 25;

/// Readiness interest for one connection, mirrored into the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub fn difference(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

/// One readiness report from [`EventManager::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub fd: RawFd,
    pub session: SessionId,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
    session: SessionId,
}

/// Façade over a level-triggered multiplexer.
///
/// The registration table and every connection's `subscribed_events` are
/// kept equal at all times; the worker re-applies masks each tick and the
/// table is rebuilt into a pollfd array on every wait.
#[derive(Debug, Default)]
pub struct EventManager {
    registered: HashMap<RawFd, Registration>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the connection's interest mask. An empty mask unregisters.
    pub fn set(&mut self, conn: &mut Connection, interest: Interest, session: SessionId) {
        if interest.is_empty() {
            self.registered.remove(&conn.id());
        } else {
            self.registered
                .insert(conn.id(), Registration { interest, session });
        }
        conn.subscribed_events = interest;
    }

    /// Adds `interest` to the connection's current mask.
    pub fn add(&mut self, conn: &mut Connection, interest: Interest, session: SessionId) {
        let merged = conn.subscribed_events | interest;
        self.set(conn, merged, session);
    }

    /// Removes `interest` from the connection's current mask.
    pub fn remove(&mut self, conn: &mut Connection, interest: Interest, session: SessionId) {
        let remaining = conn.subscribed_events.difference(interest);
        self.set(conn, remaining, session);
    }

    pub fn unregister(&mut self, conn: &mut Connection) {
        self.registered.remove(&conn.id());
        conn.subscribed_events = Interest::NONE;
    }

    /// Registered mask for an fd, if any. Used by the worker's consistency
    /// check and by tests.
    pub fn registered_interest(&self, fd: RawFd) -> Option<Interest> {
        self.registered.get(&fd).map(|reg| reg.interest)
    }

    /// Blocks up to [`WAIT_TIMEOUT_MS`] and returns the ready connections.
    ///
    /// `POLLERR`/`POLLHUP`/`POLLNVAL` are folded into both directions so a
    /// failed socket is observed through its normal read/write handlers.
    #[allow(unsafe_code)]
    pub fn wait(&mut self) -> io::Result<Vec<Ready>> {
        let entries: Vec<(RawFd, Registration)> =
            self.registered.iter().map(|(fd, reg)| (*fd, *reg)).collect();
        let mut pollfds: Vec<PollFd> = entries
            .iter()
            .map(|(fd, reg)| {
                let mut flags = PollFlags::empty();
                if reg.interest.is_readable() {
                    flags |= PollFlags::POLLIN;
                }
                if reg.interest.is_writable() {
                    flags |= PollFlags::POLLOUT;
                }
                // SAFETY: every registered fd belongs to a connection whose
                // socket is still open; closed connections are unregistered
                // by the worker's cleanup pass before the next wait, and
                // sessions keep their sockets alive until removal.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, flags)
            })
            .collect();

        poll(&mut pollfds, PollTimeout::from(WAIT_TIMEOUT_MS)).map_err(io::Error::from)?;

        let mut ready = Vec::new();
        for (pollfd, (fd, reg)) in pollfds.iter().zip(&entries) {
            let Some(revents) = pollfd.revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            let failed = revents
                .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL);
            ready.push(Ready {
                fd: *fd,
                session: reg.session,
                readable: failed || revents.contains(PollFlags::POLLIN),
                writable: failed || revents.contains(PollFlags::POLLOUT),
            });
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnTag, Connection};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        let conn = Connection::new(accepted, addr, ConnTag::Client).unwrap();
        (conn, peer)
    }

    fn wait_for_events(manager: &mut EventManager) -> Vec<Ready> {
        for _ in 0..40 {
            let ready = manager.wait().unwrap();
            if !ready.is_empty() {
                return ready;
            }
        }
        panic!("no events within 40 waits");
    }

    #[test]
    fn masks_track_registration() {
        let mut manager = EventManager::new();
        let (mut conn, _peer) = pair();

        manager.set(&mut conn, Interest::READABLE, 1);
        assert_eq!(conn.subscribed_events, Interest::READABLE);
        assert_eq!(manager.registered_interest(conn.id()), Some(Interest::READABLE));

        manager.add(&mut conn, Interest::WRITABLE, 1);
        assert_eq!(conn.subscribed_events, Interest::READABLE | Interest::WRITABLE);
        assert_eq!(
            manager.registered_interest(conn.id()),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        manager.remove(&mut conn, Interest::READABLE, 1);
        assert_eq!(manager.registered_interest(conn.id()), Some(Interest::WRITABLE));

        manager.set(&mut conn, Interest::NONE, 1);
        assert!(conn.subscribed_events.is_empty());
        assert_eq!(manager.registered_interest(conn.id()), None);
    }

    #[test]
    fn wait_reports_readable_and_writable() {
        let mut manager = EventManager::new();
        let (mut conn, mut peer) = pair();
        manager.set(&mut conn, Interest::READABLE | Interest::WRITABLE, 7);

        peer.write_all(b"x").unwrap();
        let ready = wait_for_events(&mut manager);
        let event = ready.iter().find(|e| e.fd == conn.id()).unwrap();
        assert!(event.readable);
        assert!(event.writable);
        assert_eq!(event.session, 7);
    }

    #[test]
    fn unregister_silences_events() {
        let mut manager = EventManager::new();
        let (mut conn, mut peer) = pair();
        manager.set(&mut conn, Interest::READABLE, 3);
        peer.write_all(b"x").unwrap();
        wait_for_events(&mut manager);

        manager.unregister(&mut conn);
        for _ in 0..3 {
            assert!(manager.wait().unwrap().is_empty());
        }
    }
}
