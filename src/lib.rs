//! Blocking, caching HTTP/1.1 client engine.
//!
//! One exchange executes a single logical request/response against an
//! origin server or proxy: transparent response caching, connection reuse
//! via a keyed pool, redirect/auth retries and conditional-GET revalidation.
//!
//! The engine is synchronous. Every operation is a blocking call on the
//! invoking thread; the shared pieces (connection pool, cache store,
//! statistics) are safe to use from several in-flight exchanges at once.
//!
//! ```no_run
//! use hoard::{Agent, Request};
//!
//! # fn main() -> Result<(), hoard::Error> {
//! let agent = Agent::new();
//! let mut response = agent.execute(Request::get("http://example.test/page")?)?;
//!
//! let body = response.body_to_vec()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

// Re-export the basis for this library.
pub use http;

mod error;
pub use error::Error;

mod util;

mod headers;
pub use headers::HeaderTable;

mod parse;

mod chunk;

mod body;
pub use body::RequestBody;

pub mod cache;

mod pool;
pub use pool::{Address, Connection, ConnectionPool, Connector, Proxy, TcpConnector, Transport};

mod agent;
pub use agent::{Agent, Authenticator, CookieHandler, ProxySelector};

mod exchange;
pub use exchange::{Body, Request, Response, ResponseOrigin};

pub(crate) type Result<T> = std::result::Result<T, Error>;
