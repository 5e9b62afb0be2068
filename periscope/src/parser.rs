//! Incremental HTTP request-head parsing: just enough to learn where a
//! client wants to go.

use anyhow::{anyhow, bail, Context, Result};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Incremental parser for the first request on a client connection.
///
/// Single use: accumulates bytes until the header terminator, extracts the
/// target host and port, then ignores further input — anything after the
/// first request head is pass-through body for the relay.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    head_len: usize,
    completed: bool,
    connect: bool,
    method: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

struct Head {
    connect: bool,
    method: String,
    host: String,
    port: u16,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_connect(&self) -> bool {
        self.connect
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Target host and port, available once completed.
    pub fn target(&self) -> Option<(&str, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }

    /// Bytes that followed the request head in the same reads. CONNECT
    /// tunnels forward these to the origin once it is dialed.
    pub fn residual(&self) -> &[u8] {
        &self.buf[self.head_len..]
    }

    /// The entire buffered request, head included. Plaintext requests are
    /// forwarded verbatim from here.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Ingests more bytes, completing once `\r\n\r\n` has been seen and the
    /// request head parsed. A no-op after completion.
    pub fn ingest(&mut self, data: &[u8]) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        let Some(pos) = find_terminator(&self.buf) else {
            return Ok(());
        };
        let head_len = pos + HEADER_TERMINATOR.len();
        let head = std::str::from_utf8(&self.buf[..pos]).context("request head is not valid UTF-8")?;
        let parsed = parse_head(head)?;
        self.head_len = head_len;
        self.connect = parsed.connect;
        self.method = Some(parsed.method);
        self.host = Some(parsed.host);
        self.port = Some(parsed.port);
        self.completed = true;
        Ok(())
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_head(head: &str) -> Result<Head> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("empty request line"))?
        .to_owned();
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line {request_line:?} has no target"))?;
    parts
        .next()
        .ok_or_else(|| anyhow!("request line {request_line:?} has no version"))?;

    if method == "CONNECT" {
        let (host, port) = split_host_port(target)?;
        let port = port.ok_or_else(|| anyhow!("CONNECT target {target:?} has no port"))?;
        if host.is_empty() {
            bail!("CONNECT target {target:?} has an empty host");
        }
        return Ok(Head {
            connect: true,
            method,
            host: host.to_owned(),
            port,
        });
    }

    // Absolute-form targets carry the authority; origin-form falls back to
    // the Host header.
    let (host, port) = if let Some(rest) = target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = split_host_port(authority)?;
        (host.to_owned(), port.unwrap_or(80))
    } else if let Some(rest) = target.strip_prefix("https://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = split_host_port(authority)?;
        (host.to_owned(), port.unwrap_or(443))
    } else {
        let value = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.trim())
            .ok_or_else(|| anyhow!("request for {target:?} has no Host header"))?;
        let (host, port) = split_host_port(value)?;
        (host.to_owned(), port.unwrap_or(80))
    };
    if host.is_empty() {
        bail!("request target {target:?} has an empty host");
    }
    Ok(Head {
        connect: false,
        method,
        host,
        port,
    })
}

/// Splits `host[:port]`, validating the port when present.
fn split_host_port(authority: &str) -> Result<(&str, Option<u16>)> {
    match authority.split_once(':') {
        None => Ok((authority, None)),
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("bad port in {authority:?}"))?;
            if port == 0 {
                bail!("port 0 in {authority:?}");
            }
            Ok((host, Some(port)))
        }
    }
}
