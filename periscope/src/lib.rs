//! Periscope: an intercepting HTTP/HTTPS forward proxy.
//!
//! Clients point their HTTP proxy setting here. Plaintext requests and
//! CONNECT tunnels are relayed transparently; with MITM enabled, CONNECT
//! tunnels to port 443 are terminated with a locally issued leaf
//! certificate and re-encrypted toward the origin, exposing the plaintext
//! in between.
//!
//! The crate is a two-thread design: an acceptor feeding an intake queue,
//! and a worker running a level-triggered reactor over every session.

pub mod cert;
pub mod conn;
pub mod events;
pub mod logging;
pub mod parser;
pub mod server;
pub mod session;
pub mod tls;
pub mod worker;
