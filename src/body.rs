use std::fmt;
use std::io::{self, Write};

use http::Method;

use crate::chunk::Dechunker;
use crate::util::compare_lowercase_ascii;
use crate::{Error, Result};

/// The request body handed to the engine.
///
/// The variant decides the transfer strategy and whether the body can be
/// replayed after a redirect or auth retry:
///
/// * `Empty` - no body, always retryable.
/// * `Buffered` - held in memory, `Content-Length` computed from the
///   buffer, replayed byte-for-byte on retry.
/// * `Stream` - read from the caller once. Fixed-length when `len` is
///   known, chunked otherwise. Not retryable once sent.
pub enum RequestBody {
    Empty,
    Buffered(Vec<u8>),
    Stream {
        reader: Box<dyn io::Read + Send>,
        len: Option<u64>,
    },
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Empty
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        RequestBody::Buffered(bytes.into())
    }

    pub fn reader(reader: impl io::Read + Send + 'static, len: Option<u64>) -> Self {
        RequestBody::Stream {
            reader: Box::new(reader),
            len,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestBody::Empty | RequestBody::Buffered(_))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Buffered(v) => f.debug_tuple("Buffered").field(&v.len()).finish(),
            RequestBody::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

/// Request body writing strategy. Exactly one is chosen per attempt.
#[derive(Debug)]
pub(crate) enum BodyWriter {
    None,
    Sized { left: u64 },
    Chunked { ended: bool },
}

impl BodyWriter {
    pub fn write(&mut self, input: &[u8], out: &mut dyn Write) -> Result<()> {
        match self {
            BodyWriter::None => {
                if !input.is_empty() {
                    return Err(Error::BodyContentAfterFinish);
                }
                Ok(())
            }
            BodyWriter::Sized { left } => {
                if input.len() as u64 > *left {
                    return Err(Error::BodyLargerThanContentLength);
                }
                out.write_all(input)?;
                *left -= input.len() as u64;
                Ok(())
            }
            BodyWriter::Chunked { ended } => {
                if *ended {
                    return Err(Error::BodyContentAfterFinish);
                }
                // A zero length chunk would mean end-of-body.
                if input.is_empty() {
                    return Ok(());
                }
                write!(out, "{:x}\r\n", input.len())?;
                out.write_all(input)?;
                write!(out, "\r\n")?;
                Ok(())
            }
        }
    }

    pub fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        match self {
            BodyWriter::None => Ok(()),
            BodyWriter::Sized { left } => {
                if *left != 0 {
                    return Err(Error::UnfinishedRequest);
                }
                Ok(())
            }
            BodyWriter::Chunked { ended } => {
                if !*ended {
                    out.write_all(b"0\r\n\r\n")?;
                    *ended = true;
                }
                Ok(())
            }
        }
    }
}

/// Response body framing. Precedence when headers disagree:
/// chunked > content-length > close delimited.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum BodyReader {
    /// No body is expected either due to the status or method.
    NoBody,
    /// Delimited by content-length. The value is what's left to receive.
    LengthDelimited(u64),
    /// Chunked transfer encoding.
    Chunked(Dechunker),
    /// Expect remote to close at end of body.
    CloseDelimited,
}

impl BodyReader {
    pub fn for_response<'a>(
        http10: bool,
        method: &Method,
        status_code: u16,
        header_lookup: &dyn Fn(&str) -> Option<&'a str>,
    ) -> Result<Self> {
        let is_success = (200..=299).contains(&status_code);
        let is_informational = (100..=199).contains(&status_code);

        // https://datatracker.ietf.org/doc/html/rfc2616#section-4.3
        // Responses to HEAD and successful responses to CONNECT never
        // carry a body, whatever the entity headers claim.
        if method == Method::HEAD || is_success && method == Method::CONNECT {
            return Ok(Self::NoBody);
        }

        // 1xx, 204 and 304 have no body either, unless the headers
        // explicitly disagree. When they do, the headers win.
        if is_informational || matches!(status_code, 204 | 304) {
            return Ok(match Self::header_defined(http10, header_lookup)? {
                r @ Self::Chunked(_) => r,
                Self::LengthDelimited(n) if n > 0 => Self::LengthDelimited(n),
                // No explicit framing means no body for these statuses.
                _ => Self::NoBody,
            });
        }

        Self::header_defined(http10, header_lookup)
    }

    fn header_defined<'a>(
        http10: bool,
        header_lookup: &dyn Fn(&str) -> Option<&'a str>,
    ) -> Result<Self> {
        let mut content_length: Option<u64> = None;
        let mut chunked = false;

        if let Some(value) = header_lookup("content-length") {
            let v = value
                .parse::<u64>()
                .map_err(|_| Error::BadContentLengthHeader)?;
            content_length = Some(v);
        }

        if let Some(value) = header_lookup("transfer-encoding") {
            // Header can repeat, stop looking if we found "chunked"
            chunked = value
                .split(',')
                .map(|v| v.trim())
                .any(|v| compare_lowercase_ascii(v, "chunked"));
        }

        if chunked && !http10 {
            // https://datatracker.ietf.org/doc/html/rfc2616#section-4.4
            // A non-identity transfer-coding overrides Content-Length.
            return Ok(Self::Chunked(Dechunker::new()));
        }

        if let Some(len) = content_length {
            return Ok(Self::LengthDelimited(len));
        }

        Ok(Self::CloseDelimited)
    }

    pub fn read(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        trace!("Read body");

        match self {
            BodyReader::LengthDelimited(_) => self.read_limit(src, dst),
            BodyReader::Chunked(_) => self.read_chunked(src, dst),
            BodyReader::CloseDelimited => self.read_unlimit(src, dst),
            BodyReader::NoBody => Ok((0, 0)),
        }
    }

    fn read_limit(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let Self::LengthDelimited(left) = self else {
            unreachable!()
        };
        let left_usize = (*left).min(usize::MAX as u64) as usize;

        let to_read = src.len().min(dst.len()).min(left_usize);

        dst[..to_read].copy_from_slice(&src[..to_read]);

        *left -= to_read as u64;

        Ok((to_read, to_read))
    }

    fn read_chunked(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let BodyReader::Chunked(dechunker) = self else {
            unreachable!();
        };

        dechunker.parse_input(src, dst)
    }

    fn read_unlimit(&mut self, src: &[u8], dst: &mut [u8]) -> Result<(usize, usize)> {
        let to_read = src.len().min(dst.len());

        dst[..to_read].copy_from_slice(&src[..to_read]);

        Ok((to_read, to_read))
    }

    pub fn is_ended(&self) -> bool {
        match self {
            BodyReader::NoBody => true,
            BodyReader::LengthDelimited(v) => *v == 0,
            BodyReader::Chunked(v) => v.is_ended(),
            BodyReader::CloseDelimited => false,
        }
    }

    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyReader::CloseDelimited)
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBody => write!(f, "NoBody"),
            Self::LengthDelimited(arg0) => f.debug_tuple("LengthDelimited").field(arg0).finish(),
            Self::Chunked(_) => write!(f, "Chunked"),
            Self::CloseDelimited => write!(f, "CloseDelimited"),
        }
    }
}
