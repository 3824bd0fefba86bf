//! Cache-Control directive parsing.
//!
//! Directives are derived fresh from a [`HeaderTable`] on every
//! inspection, never mutated in place. A directive absent from the
//! headers resolves to its documented default: `-1` for the numeric
//! directives, meaning "not specified".

use std::time::SystemTime;

use crate::headers::HeaderTable;

/// Directives a request carries that influence cache use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDirectives {
    pub no_cache: bool,
    pub only_if_cached: bool,
    /// Seconds, -1 when unset.
    pub max_age: i64,
    pub max_stale: i64,
    pub min_fresh: i64,
    /// Caller already supplied If-None-Match/If-Modified-Since.
    pub has_conditions: bool,
    pub has_authorization: bool,
}

impl Default for RequestDirectives {
    fn default() -> Self {
        RequestDirectives {
            no_cache: false,
            only_if_cached: false,
            max_age: -1,
            max_stale: -1,
            min_fresh: -1,
            has_conditions: false,
            has_authorization: false,
        }
    }
}

impl RequestDirectives {
    pub fn from_headers(headers: &HeaderTable) -> Self {
        let mut d = RequestDirectives::default();

        for value in headers.get_all("cache-control") {
            parse_directives(value, &mut |token, arg| {
                if token.eq_ignore_ascii_case("no-cache") {
                    d.no_cache = true;
                } else if token.eq_ignore_ascii_case("only-if-cached") {
                    d.only_if_cached = true;
                } else if token.eq_ignore_ascii_case("max-age") {
                    d.max_age = parse_seconds(arg);
                } else if token.eq_ignore_ascii_case("max-stale") {
                    d.max_stale = parse_seconds(arg);
                } else if token.eq_ignore_ascii_case("min-fresh") {
                    d.min_fresh = parse_seconds(arg);
                }
                // Unknown directives are ignored, forward compatible.
            });
        }

        for value in headers.get_all("pragma") {
            parse_directives(value, &mut |token, _| {
                if token.eq_ignore_ascii_case("no-cache") {
                    d.no_cache = true;
                }
            });
        }

        d.has_conditions =
            headers.contains("if-none-match") || headers.contains("if-modified-since");
        d.has_authorization = headers.contains("authorization");

        d
    }
}

/// Directives and freshness fields a response carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDirectives {
    pub no_cache: bool,
    /// Field name of a scoped `no-cache="field"` directive.
    pub no_cache_field: Option<String>,
    pub no_store: bool,
    pub is_public: bool,
    pub is_private: bool,
    pub private_field: Option<String>,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    /// Seconds, -1 when unset.
    pub max_age: i64,
    pub s_max_age: i64,
    pub age_seconds: i64,
    /// The Date header, when the response was served.
    pub served: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}

impl Default for ResponseDirectives {
    fn default() -> Self {
        ResponseDirectives {
            no_cache: false,
            no_cache_field: None,
            no_store: false,
            is_public: false,
            is_private: false,
            private_field: None,
            must_revalidate: false,
            proxy_revalidate: false,
            max_age: -1,
            s_max_age: -1,
            age_seconds: -1,
            served: None,
            expires: None,
            last_modified: None,
            etag: None,
        }
    }
}

impl ResponseDirectives {
    pub fn from_headers(headers: &HeaderTable) -> Self {
        let mut d = ResponseDirectives::default();

        for value in headers.get_all("cache-control") {
            parse_directives(value, &mut |token, arg| {
                if token.eq_ignore_ascii_case("no-cache") {
                    // Scoped no-cache="field" limits itself to that
                    // field and does not make the response uncacheable.
                    match arg {
                        Some(field) if !field.is_empty() => {
                            d.no_cache_field = Some(field.to_string());
                        }
                        _ => d.no_cache = true,
                    }
                } else if token.eq_ignore_ascii_case("no-store") {
                    d.no_store = true;
                } else if token.eq_ignore_ascii_case("max-age") {
                    d.max_age = parse_seconds(arg);
                } else if token.eq_ignore_ascii_case("s-maxage") {
                    d.s_max_age = parse_seconds(arg);
                } else if token.eq_ignore_ascii_case("public") {
                    d.is_public = true;
                } else if token.eq_ignore_ascii_case("private") {
                    match arg {
                        Some(field) if !field.is_empty() => {
                            d.private_field = Some(field.to_string());
                        }
                        _ => d.is_private = true,
                    }
                } else if token.eq_ignore_ascii_case("must-revalidate") {
                    d.must_revalidate = true;
                } else if token.eq_ignore_ascii_case("proxy-revalidate") {
                    d.proxy_revalidate = true;
                }
            });
        }

        for value in headers.get_all("pragma") {
            parse_directives(value, &mut |token, _| {
                if token.eq_ignore_ascii_case("no-cache") {
                    d.no_cache = true;
                }
            });
        }

        d.served = headers.get("date").and_then(parse_date);
        d.expires = headers.get("expires").and_then(parse_date);
        d.last_modified = headers.get("last-modified").and_then(parse_date);
        d.etag = headers.get("etag").map(|v| v.to_string());

        if let Some(age) = headers.get("age") {
            d.age_seconds = parse_seconds(Some(age));
        }

        d
    }
}

/// Whether a stored response may ever satisfy the given request.
///
/// Only a small set of response codes is cacheable; `no-store` defeats
/// caching outright, and an authorized request requires the response to
/// opt back in via public/must-revalidate/s-maxage.
pub fn is_cacheable(
    response_code: u16,
    request: &RequestDirectives,
    response: &ResponseDirectives,
) -> bool {
    if !matches!(response_code, 200 | 203 | 300 | 301 | 410) {
        return false;
    }

    if response.no_store {
        return false;
    }

    if request.has_authorization
        && !(response.is_public || response.must_revalidate || response.s_max_age != -1)
    {
        return false;
    }

    true
}

fn parse_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}

/// Parse a numeric directive argument.
///
/// Out of range input clamps: negative to 0, overflow to max. Input
/// that is not a number at all is left at the sentinel -1 rather than
/// being an error.
fn parse_seconds(arg: Option<&str>) -> i64 {
    let Some(arg) = arg else {
        return -1;
    };
    let arg = arg.trim();

    match arg.parse::<i64>() {
        Ok(n) if n < 0 => 0,
        Ok(n) => n,
        Err(_) => {
            let mut digits = arg.as_bytes();
            let negative = digits.first() == Some(&b'-');
            if negative {
                digits = &digits[1..];
            }
            if !digits.is_empty() && digits.iter().all(|c| c.is_ascii_digit()) {
                // A number too large for i64: clamp.
                if negative {
                    0
                } else {
                    i64::MAX
                }
            } else {
                -1
            }
        }
    }
}

/// Walk a comma separated `token[=value|="quoted value"]` list.
fn parse_directives(input: &str, f: &mut impl FnMut(&str, Option<&str>)) {
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Skip separators.
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }

        let token_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        let token = input[token_start..i].trim();

        if token.is_empty() {
            continue;
        }

        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            let value = if i < bytes.len() && bytes[i] == b'"' {
                i += 1;
                let value_start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                let v = &input[value_start..i];
                // Skip the closing quote if present.
                if i < bytes.len() {
                    i += 1;
                }
                v
            } else {
                let value_start = i;
                while i < bytes.len() && bytes[i] != b',' {
                    i += 1;
                }
                input[value_start..i].trim()
            };
            f(token, Some(value));
        } else {
            f(token, None);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn request_directives() {
        let mut h = HeaderTable::new();
        h.add("Cache-Control", "no-cache, max-age=30, min-fresh=5");
        h.add("Cache-Control", "only-if-cached");

        let d = RequestDirectives::from_headers(&h);
        assert!(d.no_cache);
        assert!(d.only_if_cached);
        assert_eq!(d.max_age, 30);
        assert_eq!(d.min_fresh, 5);
        assert_eq!(d.max_stale, -1);
        assert!(!d.has_conditions);
        assert!(!d.has_authorization);
    }

    #[test]
    fn request_conditions_detected() {
        let mut h = HeaderTable::new();
        h.add("If-Modified-Since", "Sat, 01 Jan 2022 00:00:00 GMT");
        h.add("Authorization", "Basic Zm9vOmJhcg==");

        let d = RequestDirectives::from_headers(&h);
        assert!(d.has_conditions);
        assert!(d.has_authorization);
    }

    #[test]
    fn pragma_no_cache() {
        let mut h = HeaderTable::new();
        h.add("Pragma", "no-cache");

        assert!(RequestDirectives::from_headers(&h).no_cache);
        assert!(ResponseDirectives::from_headers(&h).no_cache);
    }

    #[test]
    fn response_directives() {
        let mut h = HeaderTable::new();
        h.add(
            "Cache-Control",
            "public, max-age=60, s-maxage=120, must-revalidate",
        );
        h.add("Date", "Sat, 01 Jan 2022 00:00:00 GMT");
        h.add("ETag", "\"v1\"");
        h.add("Age", "10");

        let d = ResponseDirectives::from_headers(&h);
        assert!(d.is_public);
        assert!(d.must_revalidate);
        assert_eq!(d.max_age, 60);
        assert_eq!(d.s_max_age, 120);
        assert_eq!(d.age_seconds, 10);
        assert_eq!(d.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            d.served,
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_640_995_200))
        );
    }

    #[test]
    fn scoped_no_cache_and_private() {
        let mut h = HeaderTable::new();
        h.add("Cache-Control", "no-cache=\"set-cookie\", private=\"auth\"");

        let d = ResponseDirectives::from_headers(&h);
        assert!(!d.no_cache);
        assert_eq!(d.no_cache_field.as_deref(), Some("set-cookie"));
        assert!(!d.is_private);
        assert_eq!(d.private_field.as_deref(), Some("auth"));
    }

    #[test]
    fn numeric_clamping() {
        assert_eq!(parse_seconds(None), -1);
        assert_eq!(parse_seconds(Some("60")), 60);
        assert_eq!(parse_seconds(Some("-5")), 0);
        assert_eq!(parse_seconds(Some("99999999999999999999999")), i64::MAX);
        assert_eq!(parse_seconds(Some("-99999999999999999999999")), 0);
        assert_eq!(parse_seconds(Some("banana")), -1);
    }

    #[test]
    fn unset_max_age_is_sentinel_not_zero() {
        let h = HeaderTable::new();
        let d = ResponseDirectives::from_headers(&h);
        assert_eq!(d.max_age, -1);
        assert_eq!(d.s_max_age, -1);
        assert_eq!(d.age_seconds, -1);
    }

    #[test]
    fn unknown_directives_ignored() {
        let mut h = HeaderTable::new();
        h.add("Cache-Control", "x-future-directive=whatever, max-age=5");
        let d = ResponseDirectives::from_headers(&h);
        assert_eq!(d.max_age, 5);
    }

    #[test]
    fn cacheable_codes() {
        let req = RequestDirectives::default();
        let resp = ResponseDirectives::default();

        for code in [200, 203, 300, 301, 410] {
            assert!(is_cacheable(code, &req, &resp), "{}", code);
        }
        for code in [201, 302, 404, 500] {
            assert!(!is_cacheable(code, &req, &resp), "{}", code);
        }
    }

    #[test]
    fn no_store_defeats_caching() {
        let req = RequestDirectives::default();
        let resp = ResponseDirectives {
            no_store: true,
            ..Default::default()
        };
        assert!(!is_cacheable(200, &req, &resp));
    }

    #[test]
    fn authorization_needs_opt_in() {
        let req = RequestDirectives {
            has_authorization: true,
            ..Default::default()
        };
        let mut resp = ResponseDirectives {
            s_max_age: -1,
            ..Default::default()
        };
        assert!(!is_cacheable(200, &req, &resp));

        resp.is_public = true;
        assert!(is_cacheable(200, &req, &resp));
    }
}
