//! One endpoint of a proxy session: a non-blocking TCP socket with an
//! outbound buffer, half-close bookkeeping, and optional in-place TLS.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use tracing::debug;

use crate::events::Interest;
use crate::tls::MitmState;

/// Socket read chunk size.
pub const BUFFER_SIZE: usize = 4096;

/// Which side of a proxy session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnTag {
    /// Accepted from the listener.
    Client,
    /// Dialed toward the origin.
    Upstream,
}

impl fmt::Display for ConnTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnTag::Client => "client",
            ConnTag::Upstream => "upstream",
        })
    }
}

pub struct Connection {
    sock: TcpStream,
    tls: Option<rustls::Connection>,
    id: RawFd,
    pub tag: ConnTag,
    pub peer: SocketAddr,
    /// Target hostname, retained on upstream connections for SNI and logs.
    pub peer_host: Option<String>,
    out_buffer: Vec<u8>,
    pub subscribed_events: Interest,
    read_closed: bool,
    closed: bool,
}

impl Connection {
    /// Takes ownership of `sock` and switches it to non-blocking mode.
    pub fn new(sock: TcpStream, peer: SocketAddr, tag: ConnTag) -> io::Result<Connection> {
        sock.set_nonblocking(true)?;
        Ok(Connection {
            id: sock.as_raw_fd(),
            sock,
            tls: None,
            tag,
            peer,
            peer_host: None,
            out_buffer: Vec::new(),
            subscribed_events: Interest::NONE,
            read_closed: false,
            closed: false,
        })
    }

    /// Stable identity: the socket fd at creation. The fd stays allocated
    /// (only shut down) until the owning session drops the connection, so
    /// it is never recycled while event routing can still see it.
    pub fn id(&self) -> RawFd {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn tls_active(&self) -> bool {
        self.tls.is_some()
    }

    /// True while anything still waits to go out: buffered plaintext, or
    /// TLS records pending inside the TLS session.
    pub fn has_pending_output(&self) -> bool {
        !self.out_buffer.is_empty()
            || self.tls.as_ref().is_some_and(|tls| tls.wants_write())
    }

    /// Queues bytes for sending. Ignored once the connection is closed.
    pub fn push(&mut self, data: &[u8]) {
        if self.closed {
            return;
        }
        self.out_buffer.extend_from_slice(data);
    }

    /// Drains all currently readable bytes.
    ///
    /// Returns `Ok(None)` on peer EOF, the accumulated chunk otherwise. A
    /// would-block with nothing accumulated is re-raised so the caller keeps
    /// the read subscription; any other socket error is propagated.
    pub fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        let mut data = Vec::new();
        let eof = match &mut self.tls {
            None => Self::read_plain(&mut self.sock, &mut data)?,
            Some(tls) => Self::read_tls_records(tls, &mut self.sock, &mut data)?,
        };
        debug!(fd = self.id, tag = %self.tag, bytes = data.len(), "recv");
        if data.is_empty() {
            if eof {
                return Ok(None);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(Some(data))
    }

    fn read_plain(sock: &mut TcpStream, data: &mut Vec<u8>) -> io::Result<bool> {
        let mut chunk = [0u8; BUFFER_SIZE];
        loop {
            match sock.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_tls_records(
        tls: &mut rustls::Connection,
        sock: &mut TcpStream,
        data: &mut Vec<u8>,
    ) -> io::Result<bool> {
        // Plaintext may already sit in the TLS session from the handshake or
        // an earlier partial drain.
        if Self::drain_plaintext(tls, data)? {
            return Ok(true);
        }
        loop {
            match tls.read_tls(sock) {
                Ok(0) => return Ok(true),
                Ok(_) => {
                    let state = tls
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    if Self::drain_plaintext(tls, data)? || state.peer_has_closed() {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn drain_plaintext(tls: &mut rustls::Connection, data: &mut Vec<u8>) -> io::Result<bool> {
        let mut chunk = [0u8; BUFFER_SIZE];
        loop {
            match tls.reader().read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(true),
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much buffered output as the socket accepts right now and
    /// returns the number of buffered bytes consumed. Completes a pending
    /// flush-close once everything has drained.
    pub fn send_buffered(&mut self) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let mut sent = 0;
        match &mut self.tls {
            None => {
                if !self.out_buffer.is_empty() {
                    match self.sock.write(&self.out_buffer) {
                        Ok(n) => {
                            self.out_buffer.drain(..n);
                            sent = n;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Some(tls) => {
                // Move plaintext into the TLS layer (it may accept less than
                // offered), then drain pending records to the socket.
                if !self.out_buffer.is_empty() {
                    let n = tls.writer().write(&self.out_buffer)?;
                    self.out_buffer.drain(..n);
                    sent = n;
                }
                while tls.wants_write() {
                    match tls.write_tls(&mut self.sock) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        debug!(fd = self.id, tag = %self.tag, bytes = sent, "send");
        if self.read_closed && !self.has_pending_output() {
            self.close();
        }
        Ok(sent)
    }

    /// Switches the live socket to TLS.
    ///
    /// Client-tagged connections take the server role, presenting a
    /// CA-issued leaf for `hostname`; upstream connections take the client
    /// role with `hostname` as SNI, verified against the configured roots.
    /// The handshake runs with the socket temporarily blocking, then the
    /// socket returns to non-blocking. A no-op when already wrapped or
    /// closed.
    pub fn wrap_tls(&mut self, hostname: &str, mitm: &MitmState) -> Result<()> {
        if self.tls.is_some() || self.closed {
            return Ok(());
        }
        self.sock
            .set_nonblocking(false)
            .context("set blocking for TLS handshake")?;
        let handshake = self.blocking_handshake(hostname, mitm);
        self.sock
            .set_nonblocking(true)
            .context("restore non-blocking after TLS handshake")?;
        self.tls = Some(handshake?);
        debug!(fd = self.id, tag = %self.tag, host = hostname, "TLS established");
        Ok(())
    }

    fn blocking_handshake(&mut self, hostname: &str, mitm: &MitmState) -> Result<rustls::Connection> {
        match self.tag {
            ConnTag::Client => {
                let config = mitm.ca.server_config_for_host(hostname)?;
                let mut tls = rustls::ServerConnection::new(config)
                    .with_context(|| format!("TLS server session for {hostname}"))?;
                while tls.is_handshaking() {
                    tls.complete_io(&mut self.sock)
                        .with_context(|| format!("TLS handshake with client for {hostname}"))?;
                }
                Ok(tls.into())
            }
            ConnTag::Upstream => {
                let name = ServerName::try_from(hostname.to_owned())
                    .with_context(|| format!("invalid TLS server name {hostname}"))?;
                let mut tls = rustls::ClientConnection::new(mitm.upstream_config.clone(), name)
                    .with_context(|| format!("TLS client session for {hostname}"))?;
                while tls.is_handshaking() {
                    tls.complete_io(&mut self.sock)
                        .with_context(|| format!("TLS handshake with upstream {hostname}"))?;
                }
                Ok(tls.into())
            }
        }
    }

    /// Closes immediately when nothing is pending; otherwise stops reading
    /// and lets the remaining output drain, closing on the send that empties
    /// the buffer.
    pub fn flush_close(&mut self) {
        if self.closed {
            return;
        }
        if self.has_pending_output() {
            self.read_closed = true;
        } else {
            self.close();
        }
    }

    /// Shuts the socket down and marks the connection terminal. The fd is
    /// released when the owning session drops the connection.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!(fd = self.id, tag = %self.tag, "close");
        if let Some(tls) = &mut self.tls {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut self.sock);
        }
        let _ = self.sock.shutdown(Shutdown::Both);
        self.read_closed = false;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        let conn = Connection::new(accepted, addr, ConnTag::Client).unwrap();
        (conn, peer)
    }

    fn recv_with_retry(conn: &mut Connection) -> Option<Vec<u8>> {
        for _ in 0..100 {
            match conn.recv() {
                Ok(data) => return data,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        panic!("no data after repeated reads");
    }

    #[test]
    fn recv_would_block_without_data() {
        let (mut conn, _peer) = pair();
        let err = conn.recv().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn recv_returns_accumulated_bytes() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"hello proxy").unwrap();
        let data = recv_with_retry(&mut conn).unwrap();
        assert_eq!(data, b"hello proxy");
    }

    #[test]
    fn recv_signals_eof_as_none() {
        let (mut conn, peer) = pair();
        peer.shutdown(Shutdown::Write).unwrap();
        for _ in 0..100 {
            match conn.recv() {
                Ok(None) => return,
                Ok(Some(_)) => panic!("unexpected data"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        panic!("EOF not observed");
    }

    #[test]
    fn send_buffered_drains_to_peer() {
        let (mut conn, mut peer) = pair();
        conn.push(b"queued");
        assert!(conn.has_pending_output());
        let sent = conn.send_buffered().unwrap();
        assert_eq!(sent, 6);
        assert!(!conn.has_pending_output());

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"queued");
    }

    #[test]
    fn flush_close_waits_for_drain() {
        let (mut conn, mut peer) = pair();
        conn.push(b"last words");
        conn.flush_close();
        assert!(!conn.is_closed());
        assert!(conn.is_read_closed());

        conn.send_buffered().unwrap();
        assert!(conn.is_closed());

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"last words");
    }

    #[test]
    fn flush_close_with_empty_buffer_closes_at_once() {
        let (mut conn, _peer) = pair();
        conn.flush_close();
        assert!(conn.is_closed());
    }

    #[test]
    fn push_after_close_is_ignored() {
        let (mut conn, _peer) = pair();
        conn.close();
        conn.push(b"too late");
        assert!(!conn.has_pending_output());
        assert_eq!(conn.send_buffered().unwrap(), 0);
    }
}
