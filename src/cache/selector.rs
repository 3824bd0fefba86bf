//! Decides where a response should come from: the cache, the network,
//! or the cache pending a conditional revalidation.

use std::time::SystemTime;

use http::Uri;

use crate::cache::policy::{is_cacheable, RequestDirectives, ResponseDirectives};
use crate::cache::{RECEIVED_MILLIS, SENT_MILLIS};
use crate::headers::HeaderTable;
use crate::util::seconds_between;

/// The origin of the bytes served to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    /// Serve the stored response verbatim, no connection needed.
    Cache,
    /// Attach validator headers to an outgoing network request; the
    /// network response determines the final content.
    ConditionalCache {
        conditions: Vec<(&'static str, String)>,
    },
    /// Ignore the cache, must connect.
    Network,
}

impl ResponseSource {
    pub fn requires_network(&self) -> bool {
        !matches!(self, ResponseSource::Cache)
    }
}

/// Outcome of revalidating a cached entry against a network response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    UseCached,
    UseNetwork,
}

/// Decide the response source for `request` given a stored `cached`
/// response.
///
/// The cached header table is expected to carry the bookkeeping headers
/// the engine attached when the entry was stored (X-Sent-Millis and
/// X-Received-Millis); without them the entry's Date stands in.
pub fn choose(
    now: SystemTime,
    uri: &Uri,
    request_headers: &HeaderTable,
    cached: &HeaderTable,
) -> ResponseSource {
    let request = RequestDirectives::from_headers(request_headers);
    let response = ResponseDirectives::from_headers(cached);

    let code = match cached.response_code() {
        Some(v) => v,
        None => return ResponseSource::Network,
    };

    if !is_cacheable(code, &request, &response) {
        return ResponseSource::Network;
    }

    // A request that insists on the network, or that already carries its
    // own validator conditions, bypasses the cache entirely.
    if request.no_cache || request.has_conditions {
        return ResponseSource::Network;
    }

    let received = millis_header(cached, RECEIVED_MILLIS)
        .or(response.served)
        .unwrap_or(now);
    let sent = millis_header(cached, SENT_MILLIS).unwrap_or(received);

    let age = compute_age(now, sent, received, &response);
    let mut lifetime = freshness_lifetime(uri, received, &response);

    // The request's own max-age puts a ceiling on acceptable freshness.
    if request.max_age != -1 {
        lifetime = lifetime.min(request.max_age);
    }

    // min-fresh/max-stale default to 0 here even though the parser
    // sentinel is -1 elsewhere. Parsed seconds can be clamped to
    // i64::MAX, so the sums must saturate.
    let min_fresh = request.min_fresh.max(0);
    let max_stale = request.max_stale.max(0);

    if !response.no_cache && age.saturating_add(min_fresh) < lifetime.saturating_add(max_stale) {
        debug!("cache fresh: age={} lifetime={}", age, lifetime);
        return ResponseSource::Cache;
    }

    // Stale; revalidate if the entry has a validator.
    let mut conditions = Vec::new();

    if let Some(etag) = &response.etag {
        conditions.push(("If-None-Match", etag.clone()));
    }

    if let Some(last_modified) = response.last_modified {
        conditions.push(("If-Modified-Since", httpdate::fmt_http_date(last_modified)));
    } else if let Some(served) = response.served {
        conditions.push(("If-Modified-Since", httpdate::fmt_http_date(served)));
    }

    if conditions.is_empty() {
        ResponseSource::Network
    } else {
        ResponseSource::ConditionalCache { conditions }
    }
}

/// Given the network's answer to a conditional request, decide whose
/// body to expose.
///
/// A 304 means the cached body is still good. Beyond that, a network
/// response whose Last-Modified predates the cached entry's also keeps
/// the cached body: prefer the fresher of the two, biased toward the
/// cache. Deliberate deviation from strict staleness rules, preserved
/// for compatibility with historical client behavior.
pub fn validate(cached: &HeaderTable, network: &HeaderTable) -> Validation {
    if network.response_code() == Some(304) {
        return Validation::UseCached;
    }

    let cached_lm = cached
        .get("last-modified")
        .and_then(|v| httpdate::parse_http_date(v).ok());
    let network_lm = network
        .get("last-modified")
        .and_then(|v| httpdate::parse_http_date(v).ok());

    if let (Some(c), Some(n)) = (cached_lm, network_lm) {
        if n < c {
            return Validation::UseCached;
        }
    }

    Validation::UseNetwork
}

fn compute_age(
    now: SystemTime,
    sent: SystemTime,
    received: SystemTime,
    response: &ResponseDirectives,
) -> i64 {
    let apparent_age = match response.served {
        Some(served) => seconds_between(served, received),
        None => 0,
    };

    let received_age = apparent_age.max(response.age_seconds.max(0));
    let response_duration = seconds_between(sent, received);
    let resident_duration = seconds_between(received, now);

    received_age + response_duration + resident_duration
}

fn freshness_lifetime(uri: &Uri, received: SystemTime, response: &ResponseDirectives) -> i64 {
    if response.max_age != -1 {
        return response.max_age;
    }

    let served = response.served.unwrap_or(received);

    if let Some(expires) = response.expires {
        return seconds_between(served, expires);
    }

    if let Some(last_modified) = response.last_modified {
        // Heuristic freshness, 10% of the document's age, is only used
        // when the URI carries no query component.
        if uri.query().is_none() {
            return seconds_between(last_modified, served) / 10;
        }
    }

    0
}

fn millis_header(headers: &HeaderTable, name: &str) -> Option<SystemTime> {
    let millis = headers.get(name)?.parse::<u64>().ok()?;
    Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(millis))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn millis_of(t: SystemTime) -> String {
        t.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis()
            .to_string()
    }

    fn cached_ok(received: SystemTime) -> HeaderTable {
        let mut h = HeaderTable::new();
        h.set_status_line("HTTP/1.1 200 OK");
        h.add(SENT_MILLIS, &millis_of(received));
        h.add(RECEIVED_MILLIS, &millis_of(received));
        h
    }

    fn uri() -> Uri {
        "http://x.test/y".parse().unwrap()
    }

    #[test]
    fn fresh_within_max_age() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(99), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Cache);
    }

    #[test]
    fn stale_with_etag_is_conditional() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");
        cached.add("ETag", "\"v1\"");

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(101), &uri(), &req, &cached);

        match source {
            ResponseSource::ConditionalCache { conditions } => {
                assert_eq!(conditions[0].0, "If-None-Match");
                assert_eq!(conditions[0].1, "\"v1\"");
            }
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn stale_without_validator_is_network() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(101), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn date_stands_in_as_validator() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");
        cached.add("Date", &httpdate::fmt_http_date(t));

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(101), &uri(), &req, &cached);

        match source {
            ResponseSource::ConditionalCache { conditions } => {
                assert_eq!(conditions[0].0, "If-Modified-Since");
            }
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn request_no_cache_forces_network() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let mut req = HeaderTable::new();
        req.add("Cache-Control", "no-cache");

        let source = choose(t + Duration::from_secs(1), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn caller_conditions_force_network() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let mut req = HeaderTable::new();
        req.add("If-None-Match", "\"v0\"");

        let source = choose(t + Duration::from_secs(1), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn uncacheable_code_is_network() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.set_status_line("HTTP/1.1 302 Found");
        cached.add("Cache-Control", "max-age=100");

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(1), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn heuristic_freshness_skipped_with_query() {
        let t = at(10_000_000);
        let served = t - Duration::from_secs(1000);

        let mut cached = cached_ok(t);
        cached.add("Date", &httpdate::fmt_http_date(t));
        // Old document: heuristic lifetime would be 10% of 20 days.
        cached.add(
            "Last-Modified",
            &httpdate::fmt_http_date(served - Duration::from_secs(20 * 86400)),
        );

        let req = HeaderTable::new();

        let plain: Uri = "http://x.test/y".parse().unwrap();
        let with_query: Uri = "http://x.test/y?page=2".parse().unwrap();

        let now = t + Duration::from_secs(3600);
        assert_eq!(choose(now, &plain, &req, &cached), ResponseSource::Cache);
        assert!(matches!(
            choose(now, &with_query, &req, &cached),
            ResponseSource::ConditionalCache { .. }
        ));
    }

    #[test]
    fn request_max_age_caps_lifetime() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=1000");

        let mut req = HeaderTable::new();
        req.add("Cache-Control", "max-age=10");

        // Fresh for the response, but past the request's own ceiling.
        let source = choose(t + Duration::from_secs(60), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn max_stale_widens_acceptance() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let mut req = HeaderTable::new();
        req.add("Cache-Control", "max-stale=50");

        let source = choose(t + Duration::from_secs(120), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Cache);
    }

    #[test]
    fn min_fresh_narrows_acceptance() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let req = HeaderTable::new();
        let source = choose(t + Duration::from_secs(60), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Cache);

        // The remaining 40 seconds of freshness are not enough.
        let mut req = HeaderTable::new();
        req.add("Cache-Control", "min-fresh=50");

        let source = choose(t + Duration::from_secs(60), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn clamped_directive_values_do_not_overflow() {
        let t = at(1_000_000);

        // The parser clamps overflowing seconds to i64::MAX; adding
        // max-stale on top must not wrap.
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=99999999999999999999999");

        let mut req = HeaderTable::new();
        req.add("Cache-Control", "max-stale=1");

        let source = choose(t + Duration::from_secs(1), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Cache);

        // Same on the min-fresh side of the comparison.
        let mut cached = cached_ok(t);
        cached.add("Cache-Control", "max-age=100");

        let mut req = HeaderTable::new();
        req.add("Cache-Control", "min-fresh=99999999999999999999999");

        let source = choose(t + Duration::from_secs(1), &uri(), &req, &cached);
        assert_eq!(source, ResponseSource::Network);
    }

    #[test]
    fn expires_based_freshness() {
        let t = at(1_000_000);
        let mut cached = cached_ok(t);
        cached.add("Date", &httpdate::fmt_http_date(t));
        cached.add(
            "Expires",
            &httpdate::fmt_http_date(t + Duration::from_secs(300)),
        );

        let req = HeaderTable::new();
        assert_eq!(
            choose(t + Duration::from_secs(200), &uri(), &req, &cached),
            ResponseSource::Cache
        );
        assert!(matches!(
            choose(t + Duration::from_secs(400), &uri(), &req, &cached),
            // Date is present, so a validator exists.
            ResponseSource::ConditionalCache { .. }
        ));
    }

    #[test]
    fn validate_304_uses_cached() {
        let cached = HeaderTable::new();
        let mut network = HeaderTable::new();
        network.set_status_line("HTTP/1.1 304 Not Modified");

        assert_eq!(validate(&cached, &network), Validation::UseCached);
    }

    #[test]
    fn validate_prefers_fresher_last_modified() {
        let t1 = at(2_000_000);
        let t2 = at(3_000_000);

        let mut cached = HeaderTable::new();
        cached.add("Last-Modified", &httpdate::fmt_http_date(t2));

        let mut network = HeaderTable::new();
        network.set_status_line("HTTP/1.1 200 OK");
        network.add("Last-Modified", &httpdate::fmt_http_date(t1));

        // The network copy is older than the cache: keep the cache.
        assert_eq!(validate(&cached, &network), Validation::UseCached);

        // The other way around the network wins.
        assert_eq!(validate(&network, &cached), Validation::UseNetwork);
    }

    #[test]
    fn validate_200_without_validators_uses_network() {
        let cached = HeaderTable::new();
        let mut network = HeaderTable::new();
        network.set_status_line("HTTP/1.1 200 OK");

        assert_eq!(validate(&cached, &network), Validation::UseNetwork);
    }
}
