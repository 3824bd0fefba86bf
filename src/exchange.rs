//! One logical request/response exchange.
//!
//! [`execute`] drives the whole thing: cache consultation, connection
//! acquisition, writing the request, reading the response head, and the
//! follow-up loop for redirects and auth challenges. The returned
//! [`Response`] holds a lazy [`Body`]; the connection is recycled into
//! the pool only once that body has been read to its end.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use http::{Method, Uri};
use url::Url;

use crate::agent::Agent;
use crate::body::{BodyReader, BodyWriter, RequestBody};
use crate::cache::{
    self, is_cacheable, selector, CacheEditor, CacheEntry, CacheStats, RequestDirectives,
    ResponseDirectives, ResponseSource, Validation,
};
use crate::headers::HeaderTable;
use crate::parse::try_parse_response;
use crate::pool::{Address, Connection, ConnectionPool, Proxy};
use crate::{Error, Result};

/// Redirects and auth retries share one budget per exchange; exceeding
/// it is fatal rather than silently serving the last hop.
const MAX_FOLLOW_UPS: u32 = 5;

/// A request to execute. Built with the method constructors, then
/// decorated with headers and a body.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderTable,
    body: RequestBody,
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Request> {
        let uri: Uri = uri
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::BadUri(e.to_string()))?;
        if uri.host().is_none() {
            return Err(Error::BadUri(format!("uri has no host: {}", uri)));
        }
        Ok(Request {
            method,
            uri,
            headers: HeaderTable::new(),
            body: RequestBody::Empty,
        })
    }

    pub fn get(uri: &str) -> Result<Request> {
        Request::new(Method::GET, uri)
    }

    pub fn head(uri: &str) -> Result<Request> {
        Request::new(Method::HEAD, uri)
    }

    pub fn post(uri: &str, body: RequestBody) -> Result<Request> {
        Ok(Request::new(Method::POST, uri)?.with_body(body))
    }

    pub fn put(uri: &str, body: RequestBody) -> Result<Request> {
        Ok(Request::new(Method::PUT, uri)?.with_body(body))
    }

    pub fn delete(uri: &str) -> Result<Request> {
        Request::new(Method::DELETE, uri)
    }

    /// Append a header. Engine defaults (Host, User-Agent, ...) are only
    /// added for names the caller did not set.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }
}

/// Where the served response bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// Served from the cache, including synthetic responses produced
    /// without touching the network.
    Cache,
    Network,
}

pub struct Response {
    status: u16,
    headers: HeaderTable,
    uri: Uri,
    origin: ResponseOrigin,
    body: Body,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }

    /// The URI the response was ultimately served for, after redirects.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn origin(&self) -> ResponseOrigin {
        self.origin
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Read the entire body into memory.
    pub fn body_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.body.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("origin", &self.origin)
            .field("uri", &self.uri)
            .finish()
    }
}

/// Streaming response body.
///
/// Reading to the end releases the connection back to the pool and
/// commits any in-progress cache write. Dropping the body early closes
/// the connection and aborts the cache write instead.
pub struct Body {
    inner: BodyInner,
    editor: Option<Box<dyn CacheEditor>>,
    stats: Option<Arc<CacheStats>>,
    done: bool,
}

enum BodyInner {
    Buffered(Cursor<Vec<u8>>),
    Raw(RawBody),
    Gzip(Box<GzDecoder<RawBody>>),
}

impl Body {
    fn buffered(bytes: Vec<u8>) -> Body {
        Body {
            inner: BodyInner::Buffered(Cursor::new(bytes)),
            editor: None,
            stats: None,
            done: false,
        }
    }

    fn network(
        raw: RawBody,
        gzipped: bool,
        editor: Option<Box<dyn CacheEditor>>,
        stats: Arc<CacheStats>,
    ) -> Body {
        let inner = if gzipped {
            BodyInner::Gzip(Box::new(GzDecoder::new(raw)))
        } else {
            BodyInner::Raw(raw)
        };
        Body {
            inner,
            editor,
            stats: Some(stats),
            done: false,
        }
    }

    /// True once the body has been read to its end and the connection
    /// released.
    pub fn is_ended(&self) -> bool {
        self.done
    }

    /// Read and discard the rest of the body, releasing the connection.
    pub fn drain(&mut self) -> Result<u64> {
        let n = io::copy(self, &mut io::sink())?;
        Ok(n)
    }

    fn finish(&mut self) {
        self.done = true;
        if let Some(editor) = self.editor.take() {
            match editor.commit() {
                Ok(()) => {
                    if let Some(stats) = &self.stats {
                        stats.record_write_success();
                    }
                }
                Err(e) => {
                    warn!("cache commit failed: {}", e);
                    if let Some(stats) = &self.stats {
                        stats.record_write_abort();
                    }
                }
            }
        }
    }

    fn abort_write(&mut self) {
        if let Some(editor) = self.editor.take() {
            editor.abort();
            if let Some(stats) = &self.stats {
                stats.record_write_abort();
            }
        }
    }
}

impl Read for Body {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.done || dst.is_empty() {
            return Ok(0);
        }

        let n = match &mut self.inner {
            BodyInner::Buffered(c) => c.read(dst)?,
            BodyInner::Raw(r) => r.read(dst)?,
            BodyInner::Gzip(g) => g.read(dst)?,
        };

        if n == 0 {
            self.finish();
        } else if let Some(editor) = &mut self.editor {
            if let Err(e) = editor.write(&dst[..n]) {
                warn!("cache write failed, dropping entry: {}", e);
                self.abort_write();
            }
        }

        Ok(n)
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        // Dropped before the end of the body: the partial entry must
        // not become visible.
        self.abort_write();
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            BodyInner::Buffered(_) => "Buffered",
            BodyInner::Raw(_) => "Raw",
            BodyInner::Gzip(_) => "Gzip",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("done", &self.done)
            .finish()
    }
}

/// Reads the framed response body off a connection.
///
/// Holds the connection for the duration; when the framing says the
/// body ended cleanly, unconsumed bytes are pushed back and the
/// connection returns to the pool. Dropped mid-body, the connection is
/// closed instead.
struct RawBody {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    reader: BodyReader,
    input: Vec<u8>,
}

impl RawBody {
    fn new(
        mut conn: Connection,
        pool: Arc<ConnectionPool>,
        reader: BodyReader,
        leftover: Vec<u8>,
    ) -> RawBody {
        conn.set_outstanding(true);
        let mut raw = RawBody {
            conn: Some(conn),
            pool,
            reader,
            input: leftover,
        };
        raw.finish_if_ended();
        raw
    }

    fn finish_if_ended(&mut self) {
        if !self.reader.is_ended() {
            return;
        }
        if let Some(mut conn) = self.conn.take() {
            if !self.input.is_empty() {
                // Bytes past the body belong to the next response.
                conn.push_unread(&self.input);
                self.input.clear();
            }
            conn.set_outstanding(false);
            self.pool.recycle(conn);
        }
    }

    /// Pull more transport bytes into the input buffer. `Ok(false)`
    /// means the peer closed.
    fn fill(&mut self) -> io::Result<bool> {
        let conn = match &mut self.conn {
            Some(c) => c,
            None => return Ok(false),
        };
        let mut chunk = [0u8; 8192];
        let n = conn.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        self.input.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    fn handle_eof(&mut self) -> io::Result<usize> {
        self.conn = None;
        if self.reader.is_close_delimited() {
            // The close is the delimiter; this is the natural end.
            return Ok(0);
        }
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            Error::PrematureEndOfBody,
        ))
    }
}

impl Read for RawBody {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        loop {
            if self.reader.is_ended() {
                self.finish_if_ended();
                return Ok(0);
            }

            if self.input.is_empty() && !self.fill()? {
                return self.handle_eof();
            }

            let (used, produced) = self
                .reader
                .read(&self.input, dst)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.input.drain(..used);

            if produced > 0 || self.reader.is_ended() {
                self.finish_if_ended();
                return Ok(produced);
            }

            if used == 0 {
                // Partial framing, e.g. half a chunk size line.
                if !self.fill()? {
                    return self.handle_eof();
                }
            }
        }
    }
}

enum Followup {
    Redirect { uri: Uri },
    Authorize { header: &'static str, value: String },
}

pub(crate) fn execute(agent: &Agent, request: Request) -> Result<Response> {
    let Request {
        method,
        mut uri,
        headers: mut user_headers,
        mut body,
    } = request;

    let mut follow_ups = 0u32;
    let mut auth_header: Option<(&'static str, String)> = None;

    loop {
        agent.stats.record_request();

        let key = cache::cache_key(&method, &uri);

        if let Some(store) = &agent.cache {
            if method == Method::POST || method == Method::PUT || method == Method::DELETE {
                // Writing through a URI invalidates what is cached for it.
                let get_key = cache::cache_key(&Method::GET, &uri);
                if let Err(e) = store.remove(&get_key) {
                    warn!("cache invalidation of {} failed: {}", get_key, e);
                }
            }
        }

        let mut out = user_headers.clone();
        if !out.contains("Host") {
            out.add("Host", &host_header(&uri));
        }
        if !out.contains("User-Agent") {
            out.add("User-Agent", &agent.user_agent);
        }
        if !out.contains("Connection") {
            out.add("Connection", "Keep-Alive");
        }
        // When the caller never asked for an encoding, the engine asks
        // for gzip and owns the decompression.
        let transparent_gzip = !out.contains("Accept-Encoding");
        if transparent_gzip {
            out.add("Accept-Encoding", "gzip");
        }
        match &body {
            RequestBody::Empty => {}
            RequestBody::Buffered(bytes) => out.set("Content-Length", &bytes.len().to_string()),
            RequestBody::Stream { len: Some(n), .. } => out.set("Content-Length", &n.to_string()),
            RequestBody::Stream { len: None, .. } => out.set("Transfer-Encoding", "chunked"),
        }
        for (name, value) in agent.cookies.load(&uri, &out) {
            out.add(&name, &value);
        }
        if let Some((name, value)) = &auth_header {
            out.set(name, value);
        }

        let mut conditional: Option<(CacheEntry, Vec<u8>)> = None;
        if method == Method::GET {
            if let Some(store) = &agent.cache {
                let cached = store.get(&key).unwrap_or_else(|e| {
                    warn!("cache read of {} failed, treating as miss: {}", key, e);
                    None
                });
                if let Some((entry, stored_body)) = cached {
                    match selector::choose(SystemTime::now(), &uri, &out, &entry.response_headers)
                    {
                        ResponseSource::Cache => {
                            debug!("cache fresh, serving {} without network", uri);
                            agent.stats.record_hit();
                            return Ok(cached_response(uri, entry, stored_body));
                        }
                        ResponseSource::ConditionalCache { conditions } => {
                            for (name, value) in &conditions {
                                out.set(name, value);
                            }
                            conditional = Some((entry, stored_body));
                        }
                        ResponseSource::Network => {}
                    }
                }
            }
        }

        if RequestDirectives::from_headers(&out).only_if_cached {
            debug!("only-if-cached and no usable entry for {}", uri);
            return Ok(unsatisfiable_response(uri));
        }

        agent.stats.record_network();

        let (mut conn, reused) = acquire_route(agent, &uri)?;
        let address = conn.address().clone();
        let target = request_target(&uri, &address);

        let sent_at = SystemTime::now();
        let (mut net_headers, leftover) =
            match send_request(&mut conn, &method, &target, &out, &mut body) {
                Ok(v) => v,
                Err(e) if reused && e.is_retryable_transport() => {
                    if !body.is_retryable() {
                        return Err(Error::UnretryableBody);
                    }
                    debug!("pooled connection to {} went stale, retrying fresh", address);
                    let transport = agent.connector.connect(&address, agent.connect_timeout)?;
                    conn = Connection::new(transport, address.clone());
                    send_request(&mut conn, &method, &target, &out, &mut body)?
                }
                Err(e) => return Err(e),
            };
        let received_at = SystemTime::now();

        let code = net_headers.response_code().ok_or(Error::MissingStatusLine)?;
        let http10 = net_headers.http_minor_version() == Some(0);

        if has_connection_token(&out, "close")
            || has_connection_token(&net_headers, "close")
            || (http10 && !has_connection_token(&net_headers, "keep-alive"))
        {
            conn.signal_close();
        }

        net_headers.set(cache::SENT_MILLIS, &unix_millis(sent_at));
        net_headers.set(cache::RECEIVED_MILLIS, &unix_millis(received_at));

        agent.cookies.store(&uri, &net_headers);

        if let Some((entry, stored_body)) = conditional {
            if selector::validate(&entry.response_headers, &net_headers) == Validation::UseCached {
                debug!("revalidated {}, serving stored entry", uri);
                discard_body(agent, conn, &method, code, http10, &net_headers, leftover)?;
                agent.stats.record_hit();
                return Ok(cached_response(uri, entry, stored_body));
            }
        }

        let followup = if body.is_retryable() {
            verdict(agent, &uri, &address, code, &net_headers, auth_header.as_ref())?
        } else {
            // The body was streamed and cannot be replayed; whatever the
            // status, it is the caller's response now.
            None
        };

        if let Some(followup) = followup {
            follow_ups += 1;
            if follow_ups > MAX_FOLLOW_UPS {
                return Err(Error::TooManyRedirects);
            }
            discard_body(agent, conn, &method, code, http10, &net_headers, leftover)?;

            match followup {
                Followup::Redirect { uri: next } => {
                    debug!("following {} redirect to {}", code, next);
                    let host_changed = next.host() != uri.host()
                        || effective_port(&next) != effective_port(&uri);
                    if host_changed {
                        // Stale on the new host; credentials must not
                        // leak across origins.
                        user_headers.remove_all("Host");
                        user_headers.remove_all("Authorization");
                        auth_header = None;
                    }
                    uri = next;
                }
                Followup::Authorize { header, value } => {
                    debug!("answering {} challenge for {}", code, uri);
                    auth_header = Some((header, value));
                }
            }
            continue;
        }

        // This response is the caller's. The wire framing is decided
        // before the transparent gzip artifacts are stripped away.
        let reader = {
            let lookup = |name: &str| net_headers.get(name);
            BodyReader::for_response(http10, &method, code, &lookup)?
        };

        let gzipped = transparent_gzip
            && net_headers
                .get("content-encoding")
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false);
        if gzipped {
            net_headers.remove_all("Content-Encoding");
            net_headers.remove_all("Content-Length");
        }

        let mut editor = None;
        if method == Method::GET {
            if let Some(store) = &agent.cache {
                let request_directives = RequestDirectives::from_headers(&out);
                let response_directives = ResponseDirectives::from_headers(&net_headers);
                if !net_headers.contains("Vary")
                    && is_cacheable(code, &request_directives, &response_directives)
                {
                    let entry = CacheEntry {
                        request_uri: uri.to_string(),
                        request_method: method.to_string(),
                        response_headers: net_headers.clone(),
                        tls: None,
                    };
                    match store.put(&key, entry) {
                        Ok(e) => editor = e,
                        Err(e) => warn!("cache write of {} refused: {}", key, e),
                    }
                }
            }
        }

        let raw = RawBody::new(conn, Arc::clone(&agent.pool), reader, leftover);
        let body = Body::network(raw, gzipped, editor, Arc::clone(&agent.stats));

        return Ok(Response {
            status: code,
            headers: net_headers,
            uri,
            origin: ResponseOrigin::Network,
            body,
        });
    }
}

fn cached_response(uri: Uri, entry: CacheEntry, body: Vec<u8>) -> Response {
    let headers = entry.response_headers;
    let status = headers.response_code().unwrap_or(200);
    Response {
        status,
        headers,
        uri,
        origin: ResponseOrigin::Cache,
        body: Body::buffered(body),
    }
}

/// only-if-cached with nothing usable in the cache: a synthetic 502,
/// produced without a connection.
fn unsatisfiable_response(uri: Uri) -> Response {
    let mut headers = HeaderTable::new();
    headers.set_status_line("HTTP/1.1 502 Bad Gateway");
    headers.add("Content-Length", "0");
    Response {
        status: 502,
        headers,
        uri,
        origin: ResponseOrigin::Cache,
        body: Body::buffered(Vec::new()),
    }
}

fn acquire_route(agent: &Agent, uri: &Uri) -> Result<(Connection, bool)> {
    let candidates = match &agent.proxy {
        Some(p) => vec![p.clone()],
        None => {
            let mut candidates = agent.proxy_selector.select(uri);
            if candidates.is_empty() {
                candidates.push(Proxy::Direct);
            }
            candidates
        }
    };

    let mut last_error = None;
    for proxy in candidates {
        let address = Address::from_uri(uri, proxy.clone())?;
        match agent
            .pool
            .acquire(&address, &*agent.connector, agent.connect_timeout)
        {
            Ok(got) => return Ok(got),
            Err(e) => {
                agent.proxy_selector.connect_failed(uri, &proxy, &e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::ConnectFailed(uri.to_string(), "no route".to_string())))
}

/// Write the request head and body, then read heads until the first
/// non-informational response.
fn send_request(
    conn: &mut Connection,
    method: &Method,
    target: &str,
    headers: &HeaderTable,
    body: &mut RequestBody,
) -> Result<(HeaderTable, Vec<u8>)> {
    let mut wire = Vec::new();
    write!(wire, "{} {} HTTP/1.1\r\n", method, target)?;
    headers.write_to(&mut wire)?;
    conn.write_all(&wire)?;

    match body {
        RequestBody::Empty => {}
        RequestBody::Buffered(bytes) => {
            let mut writer = BodyWriter::Sized {
                left: bytes.len() as u64,
            };
            writer.write(bytes, conn)?;
            writer.finish(conn)?;
        }
        RequestBody::Stream { reader, len } => {
            let mut writer = match len {
                Some(n) => BodyWriter::Sized { left: *n },
                None => BodyWriter::Chunked { ended: false },
            };
            let mut buf = [0u8; 8192];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n], conn)?;
            }
            writer.finish(conn)?;
        }
    }
    conn.flush()?;

    let (mut head, mut leftover) = read_head(conn, Vec::new())?;
    while head.response_code() == Some(100) {
        trace!("skipping 100 Continue");
        let next = read_head(conn, leftover)?;
        head = next.0;
        leftover = next.1;
    }

    Ok((head, leftover))
}

fn read_head(conn: &mut Connection, mut buf: Vec<u8>) -> Result<(HeaderTable, Vec<u8>)> {
    let mut chunk = [0u8; 8192];
    loop {
        if let Some((n, head)) = try_parse_response(&buf)? {
            let leftover = buf.split_off(n);
            return Ok((head, leftover));
        }
        let n = conn.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::PrematureEndOfBody);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drain a response body we will not serve, so the connection can be
/// pooled for the follow-up request.
fn discard_body(
    agent: &Agent,
    conn: Connection,
    method: &Method,
    code: u16,
    http10: bool,
    headers: &HeaderTable,
    leftover: Vec<u8>,
) -> Result<()> {
    let reader = {
        let lookup = |name: &str| headers.get(name);
        BodyReader::for_response(http10, method, code, &lookup)?
    };
    let mut raw = RawBody::new(conn, Arc::clone(&agent.pool), reader, leftover);
    io::copy(&mut raw, &mut io::sink())?;
    Ok(())
}

/// Decide whether a response is final or warrants another attempt.
fn verdict(
    agent: &Agent,
    uri: &Uri,
    address: &Address,
    code: u16,
    headers: &HeaderTable,
    prior_auth: Option<&(&'static str, String)>,
) -> Result<Option<Followup>> {
    match code {
        300 | 301 | 302 | 303 | 305 => {
            if !agent.follow_redirects {
                return Ok(None);
            }
            let location = match headers.get("location") {
                Some(v) => v,
                // Multiple Choices without a preferred choice is final.
                None if code == 300 => return Ok(None),
                None => return Err(Error::NoLocationHeader),
            };
            let next = resolve_location(uri, location)?;
            if next.scheme_str() != uri.scheme_str() {
                // http<->https transitions are the caller's decision.
                return Ok(None);
            }
            Ok(Some(Followup::Redirect { uri: next }))
        }
        401 | 407 => {
            let proxy = code == 407;
            let challenge = if proxy {
                "proxy-authenticate"
            } else {
                "www-authenticate"
            };
            let header = if proxy {
                "Proxy-Authorization"
            } else {
                "Authorization"
            };

            let Some(realm) = headers.get_all(challenge).find_map(basic_realm) else {
                return Ok(None);
            };
            let (host, port) = if proxy {
                match &address.proxy {
                    Proxy::Http { host, port } => (host.clone(), *port),
                    Proxy::Direct => return Ok(None),
                }
            } else {
                (address.host.clone(), address.port)
            };
            let Some((username, password)) =
                agent
                    .authenticator
                    .request_credentials(&host, port, "Basic", &realm, proxy)
            else {
                return Ok(None);
            };

            let value = format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", username, password))
            );

            // The same credentials bouncing twice means they are wrong.
            if prior_auth
                .map(|(n, v)| *n == header && *v == value)
                .unwrap_or(false)
            {
                return Ok(None);
            }

            Ok(Some(Followup::Authorize { header, value }))
        }
        _ => Ok(None),
    }
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
    let base = Url::parse(&base.to_string())
        .map_err(|e| Error::BadLocationHeader(e.to_string()))?;
    let joined = base
        .join(location)
        .map_err(|e| Error::BadLocationHeader(e.to_string()))?;
    joined
        .as_str()
        .parse::<Uri>()
        .map_err(|e| Error::BadLocationHeader(e.to_string()))
}

/// Extract the realm from a `Basic realm="..."` challenge.
fn basic_realm(challenge: &str) -> Option<String> {
    let (scheme, params) = challenge.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    for param in params.split(',') {
        let Some((name, value)) = param.trim().split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("realm") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

fn host_header(uri: &Uri) -> String {
    let host = uri.host().unwrap_or("");
    let port = uri.port_u16();
    match port {
        Some(p) if p != default_port(uri) => format!("{}:{}", host, p),
        _ => host.to_string(),
    }
}

fn default_port(uri: &Uri) -> u16 {
    if uri.scheme_str() == Some("https") {
        443
    } else {
        80
    }
}

fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or_else(|| default_port(uri))
}

fn request_target(uri: &Uri, address: &Address) -> String {
    // Requests forwarded through a proxy use the absolute form; direct
    // and tunneled requests use the origin form.
    if matches!(address.proxy, Proxy::Http { .. }) && !address.tunnel {
        return uri.to_string();
    }
    uri.path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn has_connection_token(headers: &HeaderTable, token: &str) -> bool {
    headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn unix_millis(t: SystemTime) -> String {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::pool::{Connector, Transport};

    /// Hands each connect attempt the next scripted response bytes and
    /// records everything the engine writes.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        inner: Arc<ScriptInner>,
    }

    #[derive(Default)]
    struct ScriptInner {
        scripts: Mutex<VecDeque<Vec<u8>>>,
        connects: AtomicUsize,
        written: Mutex<Vec<u8>>,
    }

    impl ScriptedConnector {
        fn new(scripts: &[&[u8]]) -> Self {
            let connector = ScriptedConnector::default();
            let mut q = connector.inner.scripts.lock().unwrap();
            for s in scripts {
                q.push_back(s.to_vec());
            }
            drop(q);
            connector
        }

        fn connects(&self) -> usize {
            self.inner.connects.load(Ordering::SeqCst)
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.inner.written.lock().unwrap()).into_owned()
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(
            &self,
            address: &Address,
            _timeout: Option<Duration>,
        ) -> Result<Box<dyn Transport>> {
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .inner
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| {
                    Error::ConnectFailed(address.to_string(), "no script".to_string())
                })?;
            Ok(Box::new(ScriptedTransport {
                reads: Cursor::new(script),
                inner: Arc::clone(&self.inner),
            }))
        }
    }

    struct ScriptedTransport {
        reads: Cursor<Vec<u8>>,
        inner: Arc<ScriptInner>,
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.read(buf)
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn script(parts: &[&[u8]]) -> Vec<u8> {
        let mut all = Vec::new();
        for p in parts {
            all.extend_from_slice(p);
        }
        all
    }

    #[test]
    fn plain_get_with_default_headers() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.origin(), ResponseOrigin::Network);
        assert_eq!(r.body_to_vec().unwrap(), b"hello");

        let written = connector.written();
        assert!(written.starts_with("GET /doc HTTP/1.1\r\n"));
        assert!(written.contains("Host: x.test\r\n"));
        assert!(written.contains("User-Agent: hoard/"));
        assert!(written.contains("Connection: Keep-Alive\r\n"));
        assert!(written.contains("Accept-Encoding: gzip\r\n"));
    }

    #[test]
    fn second_get_within_max_age_is_a_cache_hit() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 5\r\n\r\nhello",
        ]);
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_cache(MemoryCacheStore::new());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r1.origin(), ResponseOrigin::Network);
        assert_eq!(r1.body_to_vec().unwrap(), b"hello");
        drop(r1);

        let mut r2 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r2.origin(), ResponseOrigin::Cache);
        assert_eq!(r2.body_to_vec().unwrap(), b"hello");

        assert_eq!(connector.connects(), 1);
        assert_eq!(agent.stats().request_count(), 2);
        assert_eq!(agent.stats().network_count(), 1);
        assert_eq!(agent.stats().hit_count(), 1);
        assert_eq!(agent.stats().write_success(), 1);
    }

    #[test]
    fn stale_entry_revalidates_with_304() {
        let s = script(&[
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=0\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello",
            b"HTTP/1.1 304 Not Modified\r\n\r\n",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_cache(MemoryCacheStore::new());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r1.body_to_vec().unwrap(), b"hello");
        drop(r1);

        let mut r2 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r2.status(), 200);
        assert_eq!(r2.origin(), ResponseOrigin::Cache);
        assert_eq!(r2.body_to_vec().unwrap(), b"hello");

        // The revalidation went over the first connection.
        assert_eq!(connector.connects(), 1);
        assert_eq!(agent.stats().hit_count(), 1);
        assert!(connector.written().contains("If-None-Match: \"v1\"\r\n"));
    }

    #[test]
    fn redirect_on_same_host_reuses_the_connection() {
        let s = script(&[
            b"HTTP/1.1 302 Found\r\nLocation: /other\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/start").unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.body_to_vec().unwrap(), b"ok");
        assert_eq!(r.uri().path(), "/other");

        assert_eq!(connector.connects(), 1);
        let written = connector.written();
        assert!(written.contains("GET /start HTTP/1.1"));
        assert!(written.contains("GET /other HTTP/1.1"));
    }

    #[test]
    fn redirect_across_hosts_dials_a_new_connection() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: http://y.test/doc\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.body_to_vec().unwrap(), b"ok");

        assert_eq!(connector.connects(), 2);
        assert!(connector.written().contains("Host: y.test\r\n"));
    }

    #[test]
    fn scheme_change_surfaces_the_redirect() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 302 Found\r\nLocation: https://x.test/doc\r\nContent-Length: 0\r\n\r\n",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.status(), 302);
        assert_eq!(r.headers().get("location"), Some("https://x.test/doc"));
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn redirect_ceiling_is_fatal() {
        let hop: &[u8] = b"HTTP/1.1 302 Found\r\nLocation: /again\r\nContent-Length: 0\r\n\r\n";
        let s = script(&[hop, hop, hop, hop, hop, hop]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let err = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::TooManyRedirects));
    }

    #[test]
    fn only_if_cached_without_entry_is_502() {
        let connector = ScriptedConnector::new(&[]);
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_cache(MemoryCacheStore::new());

        let r = agent
            .execute(
                Request::get("http://x.test/doc")
                    .unwrap()
                    .header("Cache-Control", "only-if-cached"),
            )
            .unwrap();
        assert_eq!(r.status(), 502);
        assert_eq!(r.origin(), ResponseOrigin::Cache);
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn no_store_is_never_cached() {
        let s = script(&[
            b"HTTP/1.1 200 OK\r\nCache-Control: no-store\r\nContent-Length: 1\r\n\r\na",
            b"HTTP/1.1 200 OK\r\nCache-Control: no-store\r\nContent-Length: 1\r\n\r\nb",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let store = MemoryCacheStore::new();
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_cache(store.clone());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r1.body_to_vec().unwrap(), b"a");
        drop(r1);
        assert_eq!(store.entry_count(), 0);

        let mut r2 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r2.origin(), ResponseOrigin::Network);
        assert_eq!(r2.body_to_vec().unwrap(), b"b");
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn post_invalidates_the_cached_entry() {
        let s = script(&[
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 2\r\n\r\nv1",
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 2\r\n\r\nv2",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let store = MemoryCacheStore::new();
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_cache(store.clone());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r1.body_to_vec().unwrap(), b"v1");
        drop(r1);
        assert_eq!(store.entry_count(), 1);

        let mut r2 = agent
            .execute(Request::post("http://x.test/doc", RequestBody::bytes("x=1")).unwrap())
            .unwrap();
        r2.body_to_vec().unwrap();
        drop(r2);
        assert_eq!(store.entry_count(), 0);

        let mut r3 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r3.origin(), ResponseOrigin::Network);
        assert_eq!(r3.body_to_vec().unwrap(), b"v2");
        assert_eq!(connector.connects(), 1);
    }

    struct TestCredentials;
    impl crate::Authenticator for TestCredentials {
        fn request_credentials(
            &self,
            _host: &str,
            _port: u16,
            _auth_scheme: &str,
            realm: &str,
            _proxy: bool,
        ) -> Option<(String, String)> {
            assert_eq!(realm, "lair");
            Some(("ali".to_string(), "baba".to_string()))
        }
    }

    #[test]
    fn basic_auth_challenge_is_retried_with_credentials() {
        let s = script(&[
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"lair\"\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new()
            .with_connector(connector.clone())
            .with_authenticator(TestCredentials);

        let mut r = agent
            .execute(Request::get("http://x.test/secret").unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.body_to_vec().unwrap(), b"ok");

        assert_eq!(connector.connects(), 1);
        assert!(connector
            .written()
            .contains("Authorization: Basic YWxpOmJhYmE=\r\n"));
    }

    #[test]
    fn challenge_without_credentials_surfaces_the_401() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"lair\"\r\nContent-Length: 0\r\n\r\n",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let r = agent
            .execute(Request::get("http://x.test/secret").unwrap())
            .unwrap();
        assert_eq!(r.status(), 401);
    }

    #[test]
    fn transparent_gzip_is_decoded_and_stripped() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello gzip").unwrap();
        let gz = enc.finish().unwrap();

        let mut s = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        s.extend_from_slice(&gz);

        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.body_to_vec().unwrap(), b"hello gzip");
        assert_eq!(r.headers().get("content-encoding"), None);
        assert_eq!(r.headers().get("content-length"), None);
    }

    #[test]
    fn caller_requested_encoding_is_passed_through() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"raw").unwrap();
        let gz = enc.finish().unwrap();

        let mut s = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        s.extend_from_slice(&gz);

        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(
                Request::get("http://x.test/doc")
                    .unwrap()
                    .header("Accept-Encoding", "gzip"),
            )
            .unwrap();
        // The caller asked for gzip; the bytes stay compressed.
        assert_eq!(r.headers().get("content-encoding"), Some("gzip"));
        assert_eq!(r.body_to_vec().unwrap(), gz);
    }

    #[test]
    fn chunked_response_body() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.body_to_vec().unwrap(), b"hello world");
    }

    #[test]
    fn informational_100_is_skipped() {
        let s = script(&[
            b"HTTP/1.1 100 Continue\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::post("http://x.test/doc", RequestBody::bytes("data")).unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.body_to_vec().unwrap(), b"ok");
        assert!(connector.written().contains("Content-Length: 4\r\n"));
    }

    #[test]
    fn connection_close_is_not_recycled() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        r1.body_to_vec().unwrap();
        drop(r1);
        assert_eq!(agent.pool().idle_count(), 0);

        let mut r2 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        r2.body_to_vec().unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        let err = r.body_to_vec().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn stale_pooled_connection_is_retried_fresh() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na",
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r1.body_to_vec().unwrap(), b"a");
        drop(r1);
        assert_eq!(agent.pool().idle_count(), 1);

        // The pooled transport is exhausted; the first attempt sees an
        // immediate EOF and the engine retries on a fresh connection.
        let mut r2 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r2.body_to_vec().unwrap(), b"b");
        assert_eq!(connector.connects(), 2);
    }

    #[test]
    fn stale_connection_with_streamed_body_cannot_be_replayed() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na",
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        ]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r1 = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        r1.body_to_vec().unwrap();
        drop(r1);

        let body = RequestBody::reader(Cursor::new(b"data".to_vec()), Some(4));
        let err = agent
            .execute(Request::post("http://x.test/doc", body).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::UnretryableBody));
    }

    #[test]
    fn redirected_post_replays_the_buffered_body() {
        let s = script(&[
            b"HTTP/1.1 303 See Other\r\nLocation: /result\r\nContent-Length: 0\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
        ]);
        let connector = ScriptedConnector::new(&[&s]);
        let agent = Agent::new().with_connector(connector.clone());

        let mut r = agent
            .execute(Request::post("http://x.test/submit", RequestBody::bytes("x=1")).unwrap())
            .unwrap();
        assert_eq!(r.status(), 200);
        assert_eq!(r.body_to_vec().unwrap(), b"done");

        let written = connector.written();
        assert!(written.contains("POST /submit HTTP/1.1"));
        assert!(written.contains("POST /result HTTP/1.1"));
        // The buffered body was replayed byte for byte.
        assert_eq!(written.matches("x=1").count(), 2);
    }

    #[test]
    fn redirects_can_be_disabled() {
        let connector = ScriptedConnector::new(&[
            b"HTTP/1.1 302 Found\r\nLocation: /other\r\nContent-Length: 0\r\n\r\n",
        ]);
        let agent = Agent::new()
            .with_connector(connector.clone())
            .follow_redirects(false);

        let r = agent
            .execute(Request::get("http://x.test/doc").unwrap())
            .unwrap();
        assert_eq!(r.status(), 302);
    }
}
