//! Listening front of the proxy: accept loop, intake queue, worker thread.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{info, warn};

use crate::conn::{ConnTag, Connection};
use crate::events::WAIT_TIMEOUT_MS;
use crate::tls::MitmState;
use crate::worker::{IntakeQueue, Worker};

/// Accepts clients on the caller's thread and feeds one worker reactor
/// thread through the shared intake queue.
pub struct ProxyServer {
    listener: TcpListener,
    intake: IntakeQueue,
    mitm: Option<Arc<MitmState>>,
    shutdown: Arc<AtomicBool>,
}

impl ProxyServer {
    /// Binds `127.0.0.1:<port>`. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, mitm: Option<MitmState>) -> Result<Self> {
        let listener =
            TcpListener::bind(("127.0.0.1", port)).with_context(|| format!("bind 127.0.0.1:{port}"))?;
        listener.set_nonblocking(true).context("listener non-blocking")?;
        let addr = listener.local_addr().context("listener address")?;
        info!(%addr, "listening");
        Ok(Self {
            listener,
            intake: Arc::new(Mutex::new(VecDeque::new())),
            mitm: mitm.map(Arc::new),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    /// Flag observed by the accept loop and the worker; setting it is the
    /// externally-triggered shutdown interface.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the accept loop until shutdown. The worker thread is started
    /// here and joined before returning.
    pub fn run(self) -> Result<()> {
        let worker = Worker::new(self.intake.clone(), self.mitm.clone(), self.shutdown.clone());
        let worker_thread = thread::Builder::new()
            .name("periscope-worker".into())
            .spawn(move || worker.run())
            .context("spawn worker thread")?;

        while !self.shutdown.load(Ordering::Relaxed) {
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(WAIT_TIMEOUT_MS)) {
                Ok(0) => {}
                Ok(_) => self.accept_ready(),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e).context("poll listener"),
            }
        }

        if worker_thread.join().is_err() {
            warn!("worker thread panicked");
        }
        info!("shut down");
        Ok(())
    }

    /// Accepts every currently pending client and queues it for the worker.
    fn accept_ready(&self) {
        loop {
            match self.listener.accept() {
                Ok((sock, peer)) => match Connection::new(sock, peer, ConnTag::Client) {
                    Ok(conn) => {
                        info!(fd = conn.id(), %peer, "accepted client");
                        let mut queue = self.intake.lock().unwrap_or_else(PoisonError::into_inner);
                        queue.push_back(conn);
                    }
                    Err(e) => warn!(%peer, "client setup failed: {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}
