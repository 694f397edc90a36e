use crate::http::request::{target_has_authority, RequestHead};

/// Upper bound on bytes scanned for one request head.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Header whose value routes origin-form requests.
const ROUTING_HEADER: &str = "Host";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("bad request method")]
    BadMethod,
    #[error("bad request target")]
    BadTarget,
    #[error("bad protocol version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("request head too large")]
    HeadTooLarge,
}

/// Position of the scanner within the request head.
///
/// `Init` marks the start of a line: the request line before any byte has
/// been seen, or a header line afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Init,
    Method,
    Uri,
    Version,
    Attr,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The window was consumed without reaching a routing decision.
    NeedMoreData,
    /// Enough of the head is known to route the request. `remainder` counts
    /// the trailing bytes of the fed window that were not scanned.
    Ready { head: RequestHead, remainder: usize },
}

/// Resumable request-head scanner.
///
/// Bytes can be fed in windows of any size; every field is accumulated
/// across calls, so the split points never change the result.
#[derive(Debug)]
pub struct ParserContext {
    status: ParseStatus,
    request_line_done: bool,
    expect_lf: bool,
    complete: bool,
    error: Option<ParseError>,
    scanned: usize,
    pending_remainder: usize,

    method: Vec<u8>,
    target: Vec<u8>,
    version: Vec<u8>,
    attr: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<(String, String)>,
}

enum Step {
    Continue,
    Ready,
}

impl Default for ParserContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserContext {
    pub fn new() -> Self {
        Self {
            status: ParseStatus::Init,
            request_line_done: false,
            expect_lf: false,
            complete: false,
            error: None,
            scanned: 0,
            pending_remainder: 0,
            method: Vec::new(),
            target: Vec::new(),
            version: Vec::new(),
            attr: Vec::new(),
            value: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn status(&self) -> ParseStatus {
        self.status
    }

    /// True once the empty line ending the header block has been seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Unscanned suffix length of the last window that produced `Ready`.
    /// Feeding that suffix back resumes header scanning where it stopped.
    pub fn pending_remainder(&self) -> usize {
        self.pending_remainder
    }

    /// Scans `window`, continuing from wherever the previous call stopped.
    ///
    /// Errors are sticky: once a window fails, every later call returns the
    /// same error.
    pub fn feed(&mut self, window: &[u8]) -> Result<ParseOutcome, ParseError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.complete {
            self.pending_remainder = window.len();
            return Ok(ParseOutcome::Ready {
                head: self.head(),
                remainder: window.len(),
            });
        }

        for (i, &byte) in window.iter().enumerate() {
            match self.step(byte) {
                Ok(Step::Continue) => {}
                Ok(Step::Ready) => {
                    let remainder = window.len() - i - 1;
                    self.pending_remainder = remainder;
                    return Ok(ParseOutcome::Ready {
                        head: self.head(),
                        remainder,
                    });
                }
                Err(err) => {
                    self.error = Some(err);
                    return Err(err);
                }
            }
        }

        self.pending_remainder = 0;
        Ok(ParseOutcome::NeedMoreData)
    }

    /// Snapshot of everything extracted so far.
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: String::from_utf8_lossy(&self.method).into_owned(),
            target: String::from_utf8_lossy(&self.target).into_owned(),
            version: String::from_utf8_lossy(&self.version).into_owned(),
            headers: self.headers.clone(),
        }
    }

    fn step(&mut self, byte: u8) -> Result<Step, ParseError> {
        self.scanned += 1;
        if self.scanned > MAX_HEAD_LEN {
            return Err(ParseError::HeadTooLarge);
        }

        if self.expect_lf {
            self.expect_lf = false;
            if byte != b'\n' {
                return Err(self.line_error());
            }
            return self.end_of_line();
        }

        match self.status {
            ParseStatus::Init if !self.request_line_done => {
                if !is_tchar(byte) {
                    return Err(ParseError::BadMethod);
                }
                self.method.push(byte);
                self.status = ParseStatus::Method;
            }
            ParseStatus::Method => match byte {
                b' ' => self.status = ParseStatus::Uri,
                b'\r' | b'\n' => return Err(ParseError::BadTarget),
                b if is_tchar(b) => self.method.push(b),
                _ => return Err(ParseError::BadMethod),
            },
            ParseStatus::Uri => match byte {
                b' ' | b'\r' | b'\n' if self.target.is_empty() => {
                    return Err(ParseError::BadTarget);
                }
                b' ' => self.status = ParseStatus::Version,
                b'\r' | b'\n' => return Err(ParseError::BadVersion),
                b if b.is_ascii_graphic() => self.target.push(b),
                _ => return Err(ParseError::BadTarget),
            },
            ParseStatus::Version => match byte {
                b'\r' => self.expect_lf = true,
                b'\n' => return self.end_of_line(),
                b if b.is_ascii_graphic() => self.version.push(b),
                _ => return Err(ParseError::BadVersion),
            },
            ParseStatus::Init => match byte {
                b'\r' => self.expect_lf = true,
                b'\n' => return self.end_of_line(),
                b if is_tchar(b) => {
                    self.attr.push(b);
                    self.status = ParseStatus::Attr;
                }
                // Covers an empty name (":") and obsolete line folding.
                _ => return Err(ParseError::BadHeader),
            },
            ParseStatus::Attr => match byte {
                b':' => self.status = ParseStatus::Value,
                b' ' | b'\t' => {}
                b if is_tchar(b) => self.attr.push(b),
                _ => return Err(ParseError::BadHeader),
            },
            ParseStatus::Value => match byte {
                b'\r' => self.expect_lf = true,
                b'\n' => return self.end_of_line(),
                b' ' | b'\t' if self.value.is_empty() => {}
                b if b == b'\t' || (b >= 0x20 && b != 0x7f) => self.value.push(b),
                _ => return Err(ParseError::BadHeader),
            },
        }

        Ok(Step::Continue)
    }

    fn end_of_line(&mut self) -> Result<Step, ParseError> {
        match self.status {
            ParseStatus::Version => {
                if !is_valid_version(&self.version) {
                    return Err(ParseError::BadVersion);
                }
                self.request_line_done = true;
                self.status = ParseStatus::Init;
                let routable = target_has_authority(&String::from_utf8_lossy(&self.target));
                Ok(if routable { Step::Ready } else { Step::Continue })
            }
            ParseStatus::Init => {
                self.complete = true;
                Ok(Step::Ready)
            }
            ParseStatus::Value => {
                while matches!(self.value.last(), Some(b' ' | b'\t')) {
                    self.value.pop();
                }
                let name = String::from_utf8_lossy(&self.attr).into_owned();
                let value = String::from_utf8_lossy(&self.value).into_owned();
                self.attr.clear();
                self.value.clear();
                self.status = ParseStatus::Init;

                let routing = name.eq_ignore_ascii_case(ROUTING_HEADER);
                self.headers.push((name, value));
                Ok(if routing { Step::Ready } else { Step::Continue })
            }
            _ => Err(self.line_error()),
        }
    }

    fn line_error(&self) -> ParseError {
        if self.request_line_done {
            ParseError::BadHeader
        } else {
            ParseError::BadVersion
        }
    }
}

/// RFC 9110 token characters.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// `HTTP/` followed by a major version and an optional `.minor`.
fn is_valid_version(v: &[u8]) -> bool {
    let Some(rest) = v.strip_prefix(b"HTTP/") else {
        return false;
    };
    let mut parts = rest.splitn(2, |&b| b == b'.');
    let major = parts.next().unwrap_or_default();
    let minor = parts.next();
    let digits = |p: &[u8]| !p.is_empty() && p.iter().all(u8::is_ascii_digit);
    digits(major) && minor.is_none_or(digits)
}
