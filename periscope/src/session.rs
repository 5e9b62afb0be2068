//! One client↔origin pairing and the CONNECT / MITM upgrade choreography.

use std::net::TcpStream;
use std::os::fd::RawFd;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::conn::{ConnTag, Connection};
use crate::parser::RequestParser;
use crate::tls::MitmState;

/// Sessions are identified by their client socket's fd at creation time.
pub type SessionId = RawFd;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the client's request head.
    AwaitRequest,
    /// MITM upgrade pending: the 200 reply is still draining toward the
    /// client; the client-side TLS wrap happens on the send that empties
    /// the buffer. The upstream side is already wrapped.
    MitmPending,
    /// Byte relay between the two sides.
    Relaying,
}

/// One proxied client for the lifetime of its TCP connection. Owns both
/// connections; the worker routes events here by session id and socket
/// identity.
pub struct Session {
    id: SessionId,
    client: Connection,
    upstream: Option<Connection>,
    parser: RequestParser,
    state: SessionState,
}

impl Session {
    pub fn new(client: Connection) -> Self {
        Self {
            id: client.id(),
            client,
            upstream: None,
            parser: RequestParser::new(),
            state: SessionState::AwaitRequest,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> &Connection {
        &self.client
    }

    pub fn upstream(&self) -> Option<&Connection> {
        self.upstream.as_ref()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        std::iter::once(&self.client).chain(self.upstream.as_ref())
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        std::iter::once(&mut self.client).chain(self.upstream.as_mut())
    }

    /// Removable once both sides are closed (a session that never dialed
    /// counts its missing upstream as closed).
    pub fn is_finished(&self) -> bool {
        self.client.is_closed() && self.upstream.as_ref().is_none_or(Connection::is_closed)
    }

    /// Routes a readable event by socket identity.
    pub fn on_readable(&mut self, fd: RawFd, mitm: Option<&MitmState>) -> Result<()> {
        if fd == self.client.id() {
            self.recv_from_client(mitm)
        } else if self.upstream.as_ref().is_some_and(|u| u.id() == fd) {
            self.recv_from_upstream()
        } else {
            Ok(())
        }
    }

    /// Routes a writable event by socket identity, draining the matching
    /// out-buffer.
    pub fn on_writable(&mut self, fd: RawFd, mitm: Option<&MitmState>) -> Result<()> {
        if fd == self.client.id() {
            self.send_to_client(mitm)
        } else if let Some(upstream) = self.upstream.as_mut().filter(|u| u.id() == fd) {
            upstream.send_buffered().context("send to upstream")?;
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Tears the session down after an unrecoverable error.
    pub fn abort(&mut self) {
        self.client.close();
        if let Some(upstream) = &mut self.upstream {
            upstream.close();
        }
    }

    fn recv_from_client(&mut self, mitm: Option<&MitmState>) -> Result<()> {
        if self.client.is_closed() {
            return Ok(());
        }
        let data = match self.client.recv() {
            Ok(Some(data)) => data,
            Ok(None) => {
                // Client EOF: let both sides drain what they still hold.
                debug!(session = self.id, "client EOF");
                self.client.flush_close();
                if let Some(upstream) = &mut self.upstream {
                    upstream.flush_close();
                }
                return Ok(());
            }
            Err(e) => return Err(e).context("recv from client"),
        };

        if self.parser.is_completed() {
            // Pass-through body bytes; the parser is single-use.
            if let Some(upstream) = &mut self.upstream {
                upstream.push(&data);
            }
            return Ok(());
        }

        self.parser.ingest(&data).context("parse client request")?;
        if self.parser.is_completed() && self.upstream.is_none() {
            self.connect_upstream(mitm)?;
        }
        Ok(())
    }

    fn recv_from_upstream(&mut self) -> Result<()> {
        let Some(upstream) = &mut self.upstream else {
            return Ok(());
        };
        if upstream.is_closed() {
            return Ok(());
        }
        match upstream.recv() {
            Ok(Some(data)) => {
                self.client.push(&data);
                Ok(())
            }
            Ok(None) => {
                debug!(session = self.id, "upstream EOF");
                upstream.flush_close();
                self.client.flush_close();
                Ok(())
            }
            Err(e) => Err(e).context("recv from upstream"),
        }
    }

    /// Dials the parsed target and queues the first bytes in each direction.
    /// The dial is synchronous, one of the reactor's three sanctioned
    /// blocking points; failure closes the session and no 502 is
    /// synthesized.
    fn connect_upstream(&mut self, mitm: Option<&MitmState>) -> Result<()> {
        let Some((host, port)) = self.parser.target() else {
            bail!("request completed without a target");
        };
        let (host, port) = (host.to_owned(), port);

        let sock = TcpStream::connect((host.as_str(), port))
            .with_context(|| format!("connect upstream {host}:{port}"))?;
        let peer = sock.peer_addr().context("upstream peer address")?;
        let mut upstream =
            Connection::new(sock, peer, ConnTag::Upstream).context("upstream connection setup")?;
        upstream.peer_host = Some(host.clone());
        info!(
            session = self.id,
            host = %host,
            port,
            fd = upstream.id(),
            method = self.parser.method().unwrap_or("?"),
            "connected upstream"
        );

        if self.parser.is_connect() {
            self.client.push(CONNECTION_ESTABLISHED);
            if !self.parser.residual().is_empty() {
                upstream.push(self.parser.residual());
            }
        } else {
            // Forward the buffered request verbatim; from here the stream is
            // an opaque relay.
            upstream.push(self.parser.raw());
        }

        if let Some(mitm) = mitm.filter(|m| self.parser.is_connect() && m.intercepts(port)) {
            // The 200 reply must reach the client in plaintext before the
            // client-side handshake, so the wrap waits for the drain.
            if self.client.has_pending_output() {
                self.state = SessionState::MitmPending;
            } else {
                self.client
                    .wrap_tls(&host, mitm)
                    .context("client TLS upgrade")?;
                self.state = SessionState::Relaying;
            }
            upstream
                .wrap_tls(&host, mitm)
                .context("upstream TLS upgrade")?;
        } else {
            self.state = SessionState::Relaying;
        }
        self.upstream = Some(upstream);
        Ok(())
    }

    fn send_to_client(&mut self, mitm: Option<&MitmState>) -> Result<()> {
        self.client.send_buffered().context("send to client")?;
        if self.state == SessionState::MitmPending
            && !self.client.has_pending_output()
            && !self.client.is_closed()
        {
            let Some(host) = self.upstream.as_ref().and_then(|u| u.peer_host.clone()) else {
                return Ok(());
            };
            let Some(mitm) = mitm else {
                return Ok(());
            };
            self.client
                .wrap_tls(&host, mitm)
                .context("deferred client TLS upgrade")?;
            self.state = SessionState::Relaying;
            info!(session = self.id, host = %host, "MITM established");
        }
        Ok(())
    }
}
