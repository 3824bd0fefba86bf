use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};

/// Ordered multi-map of header name/value pairs.
///
/// This is deliberately not a map: duplicate names are legal and the
/// insertion order of pairs is preserved exactly, including when the
/// table is serialized to wire form. Lookup by name is case-insensitive
/// and returns the *last* matching value, since later headers override
/// earlier ones.
///
/// The table also carries an optional status line: the request line for
/// requests, `HTTP/1.x CODE REASON` for responses.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    status_line: Option<String>,
    pairs: Vec<(String, String)>,
    response_code: Option<u16>,
    http_minor_version: Option<u8>,
    reason_phrase: Option<String>,
}

impl HeaderTable {
    pub fn new() -> Self {
        HeaderTable::default()
    }

    /// Append a pair. Duplicates are allowed; the value is right-trimmed.
    pub fn add(&mut self, name: &str, value: &str) {
        self.pairs
            .push((name.to_string(), value.trim_end().to_string()));
    }

    /// Append a pair where the value might be absent.
    ///
    /// An absent value (as opposed to an empty one) is dropped with a
    /// warning rather than stored. Historical compatibility requirement;
    /// keep this lenient.
    pub fn add_lenient(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(v) => self.add(name, v),
            None => warn!("ignoring header {} with absent value", name),
        }
    }

    /// Remove all occurrences of `name`, then add the pair.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove_all(name);
        self.add(name, value);
    }

    pub fn remove_all(&mut self, name: &str) {
        self.pairs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// The last value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_by_index(&self, index: usize) -> Option<(&str, &str)> {
        self.pairs.get(index).map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.pairs
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set the raw status line.
    ///
    /// A line of the form `HTTP/1.x CODE REASON` is parsed into the
    /// response code, http minor version and reason phrase. A line not
    /// prefixed `HTTP/` is stored verbatim and leaves those fields unset.
    pub fn set_status_line(&mut self, line: &str) {
        let line = line.trim_end();
        self.status_line = Some(line.to_string());
        self.response_code = None;
        self.http_minor_version = None;
        self.reason_phrase = None;

        let Some(rest) = line.strip_prefix("HTTP/1.") else {
            return;
        };

        let mut parts = rest.splitn(3, ' ');

        let minor = parts.next().and_then(|v| v.parse::<u8>().ok());
        let code = parts.next().and_then(|v| v.parse::<u16>().ok());

        if let (Some(minor), Some(code)) = (minor, code) {
            self.http_minor_version = Some(minor);
            self.response_code = Some(code);
            self.reason_phrase = Some(parts.next().unwrap_or("").to_string());
        }
    }

    /// Set a request line `METHOD SP target SP HTTP/1.x`.
    pub fn set_request_line(&mut self, line: &str) {
        self.status_line = Some(line.trim_end().to_string());
        self.response_code = None;
        self.http_minor_version = None;
        self.reason_phrase = None;
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }

    pub fn response_code(&self) -> Option<u16> {
        self.response_code
    }

    pub fn http_minor_version(&self) -> Option<u8> {
        self.http_minor_version
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        self.reason_phrase.as_deref()
    }

    /// Group pairs by case-insensitively normalized name, preserving
    /// value order within each name. The status line, if any, is stored
    /// under the `None` key.
    pub fn to_multimap(&self) -> BTreeMap<Option<String>, Vec<String>> {
        let mut map: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();

        if let Some(line) = &self.status_line {
            map.insert(None, vec![line.clone()]);
        }

        for (name, value) in &self.pairs {
            map.entry(Some(name.to_ascii_lowercase()))
                .or_default()
                .push(value.clone());
        }

        map
    }

    /// Inverse of [`HeaderTable::to_multimap`].
    ///
    /// The `None` key's last value becomes the status line.
    pub fn from_multimap(map: &BTreeMap<Option<String>, Vec<String>>) -> HeaderTable {
        let mut table = HeaderTable::new();

        for (name, values) in map {
            match name {
                None => {
                    if let Some(line) = values.last() {
                        table.set_status_line(line);
                    }
                }
                Some(name) => {
                    for value in values {
                        table.add(name, value);
                    }
                }
            }
        }

        table
    }

    /// Serialize to wire form: status line, pairs in order, blank line.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        if let Some(line) = &self.status_line {
            write!(out, "{}\r\n", line)?;
        }
        for (name, value) in &self.pairs {
            write!(out, "{}: {}\r\n", name, value)?;
        }
        write!(out, "\r\n")
    }
}

impl fmt::Debug for HeaderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderTable")
            .field("status_line", &self.status_line)
            .field("pairs", &self.pairs)
            .finish()
    }
}
