use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::cache::{CacheStats, CacheStore};
use crate::exchange::{self, Request, Response};
use crate::headers::HeaderTable;
use crate::pool::{ConnectionPool, Connector, Proxy, TcpConnector};
use crate::{Error, Result};

/// Cookie jar callback. The engine consults it before sending and
/// hands it every response's headers so it can pick up Set-Cookie.
pub trait CookieHandler: Send + Sync {
    /// Cookie headers to add to an outgoing request.
    fn load(&self, uri: &Uri, request: &HeaderTable) -> Vec<(String, String)> {
        let _ = (uri, request);
        Vec::new()
    }

    /// Deliver response headers so Set-Cookie can be stored.
    fn store(&self, uri: &Uri, response: &HeaderTable) {
        let _ = (uri, response);
    }
}

/// Credential callback for 401/407 challenges.
pub trait Authenticator: Send + Sync {
    /// Resolve a username/password for the challenge, or `None` to let
    /// the challenge response through to the caller.
    fn request_credentials(
        &self,
        host: &str,
        port: u16,
        auth_scheme: &str,
        realm: &str,
        proxy: bool,
    ) -> Option<(String, String)>;
}

/// Proxy selection callback, consulted when no explicit proxy is
/// configured on the agent.
pub trait ProxySelector: Send + Sync {
    /// Candidate proxies for the target, tried in order.
    fn select(&self, uri: &Uri) -> Vec<Proxy> {
        let _ = uri;
        vec![Proxy::Direct]
    }

    /// A candidate failed to connect; selectors can use this to avoid
    /// the proxy in the future.
    fn connect_failed(&self, uri: &Uri, proxy: &Proxy, error: &Error) {
        let _ = (uri, proxy, error);
    }
}

struct NoCookies;
impl CookieHandler for NoCookies {}

struct NoCredentials;
impl Authenticator for NoCredentials {
    fn request_credentials(
        &self,
        _host: &str,
        _port: u16,
        _auth_scheme: &str,
        _realm: &str,
        _proxy: bool,
    ) -> Option<(String, String)> {
        None
    }
}

struct DirectOnly;
impl ProxySelector for DirectOnly {}

const DEFAULT_USER_AGENT: &str = concat!("hoard/", env!("CARGO_PKG_VERSION"));

/// Explicitly constructed context shared by exchanges.
///
/// Everything that would otherwise be ambient process state lives
/// here: the connection pool, the cache, callback policy objects and
/// default header values. Tests construct isolated agents per case.
pub struct Agent {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) cache: Option<Arc<dyn CacheStore>>,
    pub(crate) cookies: Arc<dyn CookieHandler>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) user_agent: String,
    pub(crate) follow_redirects: bool,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) stats: Arc<CacheStats>,
}

impl Default for Agent {
    fn default() -> Self {
        Agent::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        Agent {
            pool: Arc::new(ConnectionPool::default()),
            connector: Arc::new(TcpConnector),
            cache: None,
            cookies: Arc::new(NoCookies),
            authenticator: Arc::new(NoCredentials),
            proxy: None,
            proxy_selector: Arc::new(DirectOnly),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            follow_redirects: true,
            connect_timeout: None,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn with_cache(mut self, cache: impl CacheStore + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_cookie_handler(mut self, cookies: impl CookieHandler + 'static) -> Self {
        self.cookies = Arc::new(cookies);
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Route all requests through this proxy, skipping the selector.
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_proxy_selector(mut self, selector: impl ProxySelector + 'static) -> Self {
        self.proxy_selector = Arc::new(selector);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute one logical request, following redirects and auth
    /// challenges up to the engine's retry ceiling.
    pub fn execute(&self, request: Request) -> Result<Response> {
        exchange::execute(self, request)
    }
}
