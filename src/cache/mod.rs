//! Response cache: policy parsing, source selection and the store.
//!
//! The store is consumed as a key to entry blob store with at most one
//! writer per key. Readers see either the fully-old or fully-new entry,
//! never a partial write. A store failure is treated as a cache miss by
//! the engine, never as a failure of the overall exchange.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{Method, Uri};

use crate::headers::HeaderTable;
use crate::{Error, Result};

pub mod policy;
pub mod selector;

pub use policy::{is_cacheable, RequestDirectives, ResponseDirectives};
pub use selector::{ResponseSource, Validation};

/// Bookkeeping headers attached to responses before caching, recording
/// when the request left and when the response headers arrived.
pub const SENT_MILLIS: &str = "X-Sent-Millis";
pub const RECEIVED_MILLIS: &str = "X-Received-Millis";

/// Cache key: request method plus normalized request URI.
///
/// Normalization lowercases scheme and host and drops a default port,
/// so spelling variations of the same resource share an entry.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    format!("{} {}", method, normalize_uri(uri))
}

fn normalize_uri(uri: &Uri) -> String {
    let scheme = uri
        .scheme_str()
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "http".to_string());

    let host = uri
        .host()
        .map(|h| h.to_ascii_lowercase())
        .unwrap_or_default();

    let default_port = if scheme == "https" { 443 } else { 80 };
    let port = uri.port_u16().unwrap_or(default_port);

    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    if port == default_port {
        format!("{}://{}{}", scheme, host, path_and_query)
    } else {
        format!("{}://{}:{}{}", scheme, host, port, path_and_query)
    }
}

/// TLS details of the original exchange, stored alongside https entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub cipher_suite: String,
    /// DER encoded certificates, leaf first. `None` when the peer sent
    /// no chain.
    pub peer_certificates: Option<Vec<Vec<u8>>>,
    pub local_certificates: Option<Vec<Vec<u8>>>,
}

/// A persisted cache entry: the request identity plus the response
/// headers. The body is stored separately by the [`CacheStore`].
///
/// TLS metadata is present exactly when the request URI scheme is
/// "https".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub request_uri: String,
    pub request_method: String,
    pub response_headers: HeaderTable,
    pub tls: Option<TlsInfo>,
}

impl CacheEntry {
    fn is_https(&self) -> bool {
        self.request_uri.starts_with("https:")
    }

    /// Serialize to the entry text format: URI line, method line,
    /// status line, header count, the headers, and for https a blank
    /// line followed by cipher suite and base64 certificate chains.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "{}", self.request_uri)?;
        writeln!(out, "{}", self.request_method)?;
        writeln!(
            out,
            "{}",
            self.response_headers.status_line().unwrap_or("")
        )?;
        writeln!(out, "{}", self.response_headers.len())?;
        for (name, value) in self.response_headers.iter() {
            writeln!(out, "{}: {}", name, value)?;
        }

        if let Some(tls) = &self.tls {
            writeln!(out)?;
            writeln!(out, "{}", tls.cipher_suite)?;
            write_cert_chain(out, &tls.peer_certificates)?;
            write_cert_chain(out, &tls.local_certificates)?;
        }

        Ok(())
    }

    /// Inverse of [`CacheEntry::write_to`]. A truncated entry is a
    /// cache read failure, which the engine degrades to a cache miss.
    pub fn read_from(input: &mut dyn BufRead) -> Result<Self> {
        let request_uri = read_line(input)?;
        let request_method = read_line(input)?;

        let mut response_headers = HeaderTable::new();
        response_headers.set_status_line(&read_line(input)?);

        let header_count = read_line(input)?
            .parse::<usize>()
            .map_err(|_| Error::CacheRead("bad header count".to_string()))?;

        for _ in 0..header_count {
            let line = read_line(input)?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::CacheRead(format!("bad header line: {}", line)))?;
            response_headers.add(name, value.trim_start());
        }

        let tls = if request_uri.starts_with("https:") {
            let blank = read_line(input)?;
            if !blank.is_empty() {
                return Err(Error::CacheRead("expected blank line".to_string()));
            }
            Some(TlsInfo {
                cipher_suite: read_line(input)?,
                peer_certificates: read_cert_chain(input)?,
                local_certificates: read_cert_chain(input)?,
            })
        } else {
            None
        };

        Ok(CacheEntry {
            request_uri,
            request_method,
            response_headers,
            tls,
        })
    }
}

fn write_cert_chain(out: &mut dyn Write, chain: &Option<Vec<Vec<u8>>>) -> io::Result<()> {
    match chain {
        None => writeln!(out, "-1"),
        Some(certs) => {
            writeln!(out, "{}", certs.len())?;
            for cert in certs {
                writeln!(out, "{}", BASE64.encode(cert))?;
            }
            Ok(())
        }
    }
}

fn read_cert_chain(input: &mut dyn BufRead) -> Result<Option<Vec<Vec<u8>>>> {
    let count = read_line(input)?
        .parse::<i64>()
        .map_err(|_| Error::CacheRead("bad certificate count".to_string()))?;

    if count == -1 {
        return Ok(None);
    }

    let mut certs = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let line = read_line(input)?;
        let cert = BASE64
            .decode(line.as_bytes())
            .map_err(|e| Error::CacheRead(format!("bad certificate: {}", e)))?;
        certs.push(cert);
    }

    Ok(Some(certs))
}

fn read_line(input: &mut dyn BufRead) -> Result<String> {
    let mut line = String::new();
    let n = input
        .read_line(&mut line)
        .map_err(|e| Error::CacheRead(e.to_string()))?;
    if n == 0 {
        return Err(Error::CacheRead("unexpected end of entry".to_string()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Durable response cache, keyed by [`cache_key`].
pub trait CacheStore: Send + Sync {
    /// Look up an entry and its stored body.
    fn get(&self, key: &str) -> Result<Option<(CacheEntry, Vec<u8>)>>;

    /// Begin writing an entry. Returns `None` when another writer
    /// already holds this key.
    fn put(&self, key: &str, entry: CacheEntry) -> Result<Option<Box<dyn CacheEditor>>>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// In-progress cache write. The entry becomes visible to readers only
/// on [`CacheEditor::commit`]; dropping or aborting leaves the previous
/// entry (if any) untouched.
pub trait CacheEditor: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>);
}

/// Statistics shared by all exchanges using one agent.
#[derive(Debug, Default)]
pub struct CacheStats {
    request_count: AtomicU64,
    hit_count: AtomicU64,
    network_count: AtomicU64,
    write_success: AtomicU64,
    write_abort: AtomicU64,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn network_count(&self) -> u64 {
        self.network_count.load(Ordering::Relaxed)
    }

    pub fn write_success(&self) -> u64 {
        self.write_success.load(Ordering::Relaxed)
    }

    pub fn write_abort(&self) -> u64 {
        self.write_abort.load(Ordering::Relaxed)
    }

    pub(crate) fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_network(&self) {
        self.network_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_success(&self) {
        self.write_success.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_abort(&self) {
        self.write_abort.fetch_add(1, Ordering::Relaxed);
    }
}

/// A `CacheStore` backed by process memory. Useful in tests and as a
/// private per-agent cache. Clones share the same underlying store.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    entries: Mutex<HashMap<String, (CacheEntry, Vec<u8>)>>,
    pending: Mutex<HashSet<String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        MemoryCacheStore::default()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<(CacheEntry, Vec<u8>)>> {
        let entries = self.inner.entries.lock().unwrap();
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: CacheEntry) -> Result<Option<Box<dyn CacheEditor>>> {
        let mut pending = self.inner.pending.lock().unwrap();
        if !pending.insert(key.to_string()) {
            // Another writer holds this key: fail fast.
            return Ok(None);
        }

        Ok(Some(Box::new(MemoryEditor {
            inner: self.inner.clone(),
            key: key.to_string(),
            entry: Some(entry),
            body: Vec::new(),
        })))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

struct MemoryEditor {
    inner: Arc<StoreInner>,
    key: String,
    entry: Option<CacheEntry>,
    body: Vec<u8>,
}

impl CacheEditor for MemoryEditor {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let entry = self.entry.take().expect("commit once");
        let body = std::mem::take(&mut self.body);

        // Entry and body land atomically under the entries lock.
        self.inner
            .entries
            .lock()
            .unwrap()
            .insert(self.key.clone(), (entry, body));
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

impl Drop for MemoryEditor {
    fn drop(&mut self) {
        self.inner.pending.lock().unwrap().remove(&self.key);
    }
}
