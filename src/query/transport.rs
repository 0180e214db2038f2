//! UDP and TCP DNS clients.
//!
//! Each attempt uses its own socket: an ephemeral, connected UDP socket or a fresh TCP
//! connection that is shut down once the reply is read. Attempts are bounded by
//! [`TransportOptions::timeout`]; timeouts and transient connection errors are retried up to
//! [`TransportOptions::attempts`] times in total. Anything that parses as a DNS message with
//! the right transaction id is a successful exchange, whatever its RCODE.

use crate::error::Error;
use crate::query::{Query, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};
use trust_dns_proto::op::Message;

/// Largest datagram accepted, matching the EDNS payload size queries advertise.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Transport used for an exchange.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Connectionless, one datagram each way.
    Udp,
    /// Connection oriented, length-prefixed framing.
    #[default]
    Tcp,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Udp => f.write_str("UDP"),
            Mode::Tcp => f.write_str("TCP"),
        }
    }
}

/// Timeout and retry budget for a single [`send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Upper bound for one attempt, connection setup included.
    pub timeout: Duration,
    /// Total number of attempts, at least one.
    pub attempts: u32,
    /// Pause between two attempts.
    pub retry_delay: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Send `query` to `server` over UDP with default options.
///
/// # Errors
///
/// See [`send`].
pub async fn udp(query: &Query, server: SocketAddr) -> Result<Response, Error> {
    send(query, server, Mode::Udp, &TransportOptions::default()).await
}

/// Send `query` to `server` over TCP with default options.
///
/// # Errors
///
/// See [`send`].
pub async fn tcp(query: &Query, server: SocketAddr) -> Result<Response, Error> {
    send(query, server, Mode::Tcp, &TransportOptions::default()).await
}

/// Send `query` to `server` and wait for the reply carrying the same transaction id.
///
/// # Errors
///
/// Returns [`Error::TransportTimeout`] when every attempt timed out, or [`Error::IO`] when the
/// last attempt failed to connect.
///
/// Returns [`Error::MalformedResponse`] as soon as a reply can't be parsed, or a TCP reply
/// carries a different transaction id.
pub async fn send(
    query: &Query,
    server: SocketAddr,
    mode: Mode,
    options: &TransportOptions,
) -> Result<Response, Error> {
    let wire = query.to_wire()?;
    let attempts = options.attempts.max(1);
    let mut last_io_error = None;

    for attempt in 1..=attempts {
        let exchange = async {
            match mode {
                Mode::Udp => exchange_udp(&wire, query.id(), server).await,
                Mode::Tcp => exchange_tcp(&wire, query.id(), server).await,
            }
        };
        match tokio::time::timeout(options.timeout, exchange).await {
            Ok(Ok(message)) => {
                debug!(
                    server = %server,
                    transport = %mode,
                    attempt,
                    rcode = %message.response_code(),
                    "reply to {query}"
                );
                return Ok(Response::new(message, server, mode));
            }
            Ok(Err(AttemptError::Fatal(err))) => return Err(err),
            Ok(Err(AttemptError::Transient(err))) => {
                warn!("{mode} query {query} to {server} failed ({attempt}/{attempts}): {err}");
                last_io_error = Some(err);
            }
            Err(_) => {
                warn!("{mode} query {query} to {server} timed out ({attempt}/{attempts})");
                last_io_error = None;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(options.retry_delay).await;
        }
    }

    match last_io_error {
        Some(err) => Err(Error::IO(err)),
        None => Err(Error::TransportTimeout {
            server,
            mode,
            attempts,
        }),
    }
}

enum AttemptError {
    /// Worth another attempt.
    Transient(io::Error),
    /// Ends the exchange.
    Fatal(Error),
}

impl From<io::Error> for AttemptError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => AttemptError::Transient(err),
            _ => AttemptError::Fatal(Error::IO(err)),
        }
    }
}

fn malformed(server: SocketAddr, reason: impl Into<String>) -> AttemptError {
    AttemptError::Fatal(Error::MalformedResponse {
        server,
        reason: reason.into(),
    })
}

async fn exchange_udp(wire: &[u8], id: u16, server: SocketAddr) -> Result<Message, AttemptError> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;
    socket.send(wire).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        let reply = &buf[..len];
        if reply.len() < 2 {
            debug!("ignoring {len} byte datagram from {server}");
            continue;
        }
        let reply_id = u16::from_be_bytes([reply[0], reply[1]]);
        if reply_id != id {
            debug!("ignoring datagram from {server} with id {reply_id}, expected {id}");
            continue;
        }
        return Message::from_vec(reply).map_err(|err| malformed(server, err.to_string()));
    }
}

async fn exchange_tcp(wire: &[u8], id: u16, server: SocketAddr) -> Result<Message, AttemptError> {
    let len = u16::try_from(wire.len()).map_err(|_| {
        AttemptError::Fatal(Error::IO(io::Error::new(
            ErrorKind::InvalidInput,
            "query does not fit a TCP frame",
        )))
    })?;

    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;

    let mut frame = Vec::with_capacity(wire.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(wire);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let reply_len = usize::from(u16::from_be_bytes(len_buf));

    let mut reply = vec![0u8; reply_len];
    stream.read_exact(&mut reply).await.map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            malformed(server, format!("connection closed inside a {reply_len} byte frame"))
        } else {
            err.into()
        }
    })?;

    // Teardown failures don't affect a reply we already hold.
    let _ = stream.shutdown().await;

    let message = Message::from_vec(&reply).map_err(|err| malformed(server, err.to_string()))?;
    if message.id() != id {
        return Err(malformed(
            server,
            format!("transaction id {} does not match query id {id}", message.id()),
        ));
    }
    Ok(message)
}
