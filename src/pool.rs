//! Keyed pool of reusable transport connections.
//!
//! The pool guards its idle set with a single lock; handing out and
//! returning a connection are atomic check-then-remove / add
//! operations. Socket I/O never happens under that lock.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use http::Uri;

use crate::{Error, Result};

/// Ordered byte stream to a remote. DNS, TLS and socket mechanics live
/// behind this trait; the engine only reads and writes.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// How to reach the origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http { host: String, port: u16 },
}

/// Pool key: destination plus the route towards it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub proxy: Proxy,
    /// The route requires a CONNECT tunnel through the proxy.
    pub tunnel: bool,
}

impl Address {
    pub fn from_uri(uri: &Uri, proxy: Proxy) -> Result<Address> {
        let host = uri
            .host()
            .ok_or_else(|| Error::BadHeader(format!("uri has no host: {}", uri)))?
            .to_string();

        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let tunnel = https && proxy != Proxy::Direct;

        Ok(Address {
            host,
            port,
            proxy,
            tunnel,
        })
    }

    /// The host/port the transport actually dials: the proxy if any.
    pub fn socket_host(&self) -> (&str, u16) {
        match &self.proxy {
            Proxy::Direct => (&self.host, self.port),
            Proxy::Http { host, port } => (host, *port),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Proxy::Http { host, port } = &self.proxy {
            write!(f, " via {}:{}", host, port)?;
        }
        Ok(())
    }
}

/// Opens new transports. Injected so tests can script connections and
/// so TLS can be layered in from outside the engine.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &Address, timeout: Option<Duration>) -> Result<Box<dyn Transport>>;
}

/// Plain TCP connector. Does not speak TLS; https requires an injected
/// [`Connector`] that wraps the stream.
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, address: &Address, timeout: Option<Duration>) -> Result<Box<dyn Transport>> {
        let (host, port) = address.socket_host();

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::ConnectFailed(address.to_string(), e.to_string()))?;

        let mut last_error = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(Box::new(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".to_string());

        Err(Error::ConnectFailed(address.to_string(), reason))
    }
}

/// One reusable transport connection.
///
/// A connection handed back to the pool must have no partially written
/// request and no unconsumed response bytes; `outstanding` tracks that.
pub struct Connection {
    transport: Box<dyn Transport>,
    address: Address,
    /// Bytes read past the current parse point, served before the
    /// transport on the next read.
    unread: Vec<u8>,
    outstanding: bool,
    close_signaled: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, address: Address) -> Self {
        Connection {
            transport,
            address,
            unread: Vec::new(),
            outstanding: false,
            close_signaled: false,
        }
    }

    /// Push back bytes that were read off the transport but belong to
    /// the next response.
    pub(crate) fn push_unread(&mut self, bytes: &[u8]) {
        self.unread.splice(0..0, bytes.iter().copied());
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Mark that a request has been written and the response is not yet
    /// fully drained.
    pub(crate) fn set_outstanding(&mut self, outstanding: bool) {
        self.outstanding = outstanding;
    }

    pub fn is_idle(&self) -> bool {
        !self.outstanding
    }

    /// Record that either side sent `Connection: close`.
    pub(crate) fn signal_close(&mut self) {
        self.close_signaled = true;
    }

    pub fn is_close_signaled(&self) -> bool {
        self.close_signaled
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.unread.is_empty() {
            let n = self.unread.len().min(buf.len());
            buf[..n].copy_from_slice(&self.unread[..n]);
            self.unread.drain(..n);
            return Ok(n);
        }
        self.transport.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("outstanding", &self.outstanding)
            .field("close_signaled", &self.close_signaled)
            .finish()
    }
}

const MAX_IDLE_CONNECTIONS: usize = 5;

/// Idle connections keyed by [`Address`].
///
/// There is no timer based expiry; a pooled connection whose peer went
/// away is detected lazily on next use and retried by the caller on a
/// fresh connection.
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(MAX_IDLE_CONNECTIONS)
    }
}

impl ConnectionPool {
    pub fn new(max_idle: usize) -> Self {
        ConnectionPool {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// An idle connection for `address`, or a freshly dialed one.
    ///
    /// The boolean is true when the connection came from the pool, in
    /// which case it may be stale and a first-use failure warrants a
    /// retry on a new connection.
    pub fn acquire(
        &self,
        address: &Address,
        connector: &dyn Connector,
        timeout: Option<Duration>,
    ) -> Result<(Connection, bool)> {
        if let Some(conn) = self.try_acquire(address) {
            debug!("connection from pool for {}", address);
            return Ok((conn, true));
        }

        debug!("dialing {}", address);
        let transport = connector.connect(address, timeout)?;
        Ok((Connection::new(transport, address.clone()), false))
    }

    /// Atomically remove and return an idle connection matching
    /// `address`.
    pub fn try_acquire(&self, address: &Address) -> Option<Connection> {
        let mut idle = self.idle.lock().unwrap();
        let pos = idle.iter().position(|c| c.address() == address)?;
        Some(idle.swap_remove(pos))
    }

    /// Return a connection to the idle set.
    ///
    /// Refused (the connection is dropped, closing the transport) when
    /// the connection still has traffic in flight, when its peer
    /// signaled close, or when the pool is full.
    pub fn recycle(&self, connection: Connection) {
        if !connection.is_idle() || connection.is_close_signaled() {
            debug!("discarding connection to {}", connection.address());
            return;
        }

        let mut idle = self.idle.lock().unwrap();
        if idle.len() >= self.max_idle {
            debug!("pool full, discarding connection to {}", connection.address());
            return;
        }
        idle.push(connection);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}
