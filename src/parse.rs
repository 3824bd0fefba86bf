use crate::headers::HeaderTable;
use crate::{Error, Result};

pub(crate) const MAX_RESPONSE_HEADERS: usize = 128;

/// Try parsing a response status line + headers from `input`.
///
/// Returns `None` until the input holds the entire head (terminated by
/// the blank line). On success the `usize` is how many bytes of input
/// were consumed.
pub(crate) fn try_parse_response(input: &[u8]) -> Result<Option<(usize, HeaderTable)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let n = match response.parse(input)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let code = response.code.ok_or(Error::MissingStatusLine)?;
    let minor = response.version.ok_or(Error::MissingStatusLine)?;
    let reason = response.reason.unwrap_or("");

    if !(100..=599).contains(&code) {
        return Err(Error::ResponseInvalidStatus);
    }

    let mut table = HeaderTable::new();
    table.set_status_line(&format!("HTTP/1.{} {} {}", minor, code, reason));

    for h in response.headers {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| Error::BadHeader(format!("{} value is not utf-8", h.name)))?;
        table.add(h.name, value);
    }

    trace!("Response header parsed, status {}", code);

    Ok(Some((n, table)))
}
