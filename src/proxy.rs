use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::filter::DomainFilter;
use crate::http::{self, CLIENT_IO_TIMEOUT};
use crate::logger::{AccessLog, Classification, RelayOutcome};

/// Per-operation timeout on the upstream socket.
pub const UPSTREAM_IO_TIMEOUT: Duration = Duration::from_secs(10);

const RELAY_BUF_SIZE: usize = 16 * 1024;
const LISTEN_BACKLOG: i32 = 1024;
/// How long shutdown waits for in-flight connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nAccess Denied: Domain is blocked.";
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";

/// Accept loop plus the shared state every connection handler borrows.
pub struct Proxy {
    filter: Arc<DomainFilter>,
    log: AccessLog,
    max_connections: usize,
}

impl Proxy {
    pub fn new(filter: Arc<DomainFilter>, log: AccessLog, max_connections: usize) -> Self {
        Self {
            filter,
            log,
            max_connections,
        }
    }

    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = bind(addr)?;
        info!("proxy listening on http://{addr}");
        self.serve(listener).await
    }

    /// Accepts connections until Ctrl-C, one task per connection.
    ///
    /// Concurrency is capped by a semaphore whose permit rides in each task;
    /// when all permits are out the accept loop waits, which shows up to
    /// clients as connection backlog rather than unbounded task growth.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let Proxy {
            filter,
            log,
            max_connections,
        } = self;
        let limiter = Arc::new(Semaphore::new(max_connections));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let Ok(permit) = limiter.clone().acquire_owned().await else {
                        break;
                    };
                    let filter = filter.clone();
                    let log = log.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, peer, filter, log).await;
                    });
                }
                _ = signal::ctrl_c() => break,
            }
        }

        info!("shutting down, draining active connections");
        drop(listener);
        match timeout(DRAIN_TIMEOUT, limiter.acquire_many(max_connections as u32)).await {
            Ok(_) => info!("all connections drained"),
            Err(_) => warn!("drain timed out with connections still active"),
        }
        Ok(())
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr} (is the port already in use?)"))?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into()).context("failed to register listener with the runtime")
}

/// Runs one connection through the full pipeline: frame, parse, filter,
/// connect, forward, relay, log.
///
/// Framing failures and host-less requests drop the connection with nothing
/// on the wire. Blocked hosts get the fixed 403 and a BLOCKED record. A
/// failed upstream connect gets the fixed 502 and no record. Once the
/// upstream is connected the outcome is logged ALLOWED with whatever byte
/// count the relay managed, even if it was cut short.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    filter: Arc<DomainFilter>,
    log: AccessLog,
) {
    let _ = client.set_nodelay(true);
    let client_ip = peer.ip().to_string();

    let block = match http::read_header_block(&mut client).await {
        Ok(block) => block,
        Err(e) => {
            debug!(client = %client_ip, error = %e, "dropped before headers completed");
            return;
        }
    };

    let req = http::parse(&block);
    if req.host.is_empty() {
        debug!(client = %client_ip, "request carried no usable Host header, dropping");
        return;
    }

    if filter.is_blocked(&req.host) {
        let _ = timeout(CLIENT_IO_TIMEOUT, client.write_all(RESPONSE_403)).await;
        log.record(RelayOutcome {
            client_ip,
            host: req.host,
            port: req.port,
            method: req.method,
            path: req.path,
            classification: Classification::Blocked,
            bytes: 0,
        });
        return;
    }

    let mut upstream = match connect_upstream(&req.host, &req.port).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client = %client_ip, error = %e, "sending 502");
            let _ = timeout(CLIENT_IO_TIMEOUT, client.write_all(RESPONSE_502)).await;
            return;
        }
    };

    let outbound = http::rewrite(&req);
    if let Err(e) = send_upstream(&mut upstream, &outbound).await {
        // The relay below surfaces this as a short or empty response.
        debug!(client = %client_ip, error = %e, "failed to forward request upstream");
    }

    let bytes = relay(&mut upstream, &mut client).await;
    log.record(RelayOutcome {
        client_ip,
        host: req.host,
        port: req.port,
        method: req.method,
        path: req.path,
        classification: Classification::Allowed,
        bytes,
    });
}

/// Opens the origin connection with a single resolve+connect attempt.
pub async fn connect_upstream(host: &str, port: &str) -> Result<TcpStream, ProxyError> {
    let unreachable = |source| ProxyError::UpstreamUnreachable {
        host: host.to_string(),
        port: port.to_string(),
        source,
    };
    match timeout(UPSTREAM_IO_TIMEOUT, TcpStream::connect(format!("{host}:{port}"))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(unreachable(e)),
        Err(_) => Err(unreachable(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

async fn send_upstream(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    match timeout(UPSTREAM_IO_TIMEOUT, stream.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream write timed out",
        )),
    }
}

/// Copies the origin's response to the client until either side stops.
///
/// Read failures and timeouts end the stream; a failed client write
/// truncates it. Either way the bytes already delivered are reported, never
/// an error.
pub async fn relay<R, W>(from: &mut R, to: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match timeout(UPSTREAM_IO_TIMEOUT, from.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(_)) => break,
            Ok(Err(e)) => {
                debug!(error = %e, "read failed mid-stream, ending relay");
                break;
            }
            Err(_) => {
                debug!("read timed out mid-stream, ending relay");
                break;
            }
        };
        match timeout(CLIENT_IO_TIMEOUT, to.write_all(&buf[..n])).await {
            Ok(Ok(())) => total += n as u64,
            Ok(Err(e)) => {
                debug!(error = %e, "write failed, truncating relay");
                break;
            }
            Err(_) => {
                debug!("write timed out, truncating relay");
                break;
            }
        }
    }
    total
}
