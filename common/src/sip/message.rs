//! Control message codec.
//!
//! Text requests and responses: a start line, `Name: value` headers and
//! an optional body, every line `\r\n`-terminated. `Content-Length` is
//! always derived from the body on the way out and checked on the way in.

use std::fmt;
use std::str::FromStr;

use crate::error::{CallError, Result};

/// Protocol token used on every start line.
pub const PROTOCOL: &str = "SIP/2.0";

/// Headers every control message must carry.
pub const REQUIRED_HEADERS: [&str; 6] = ["Via", "From", "To", "Call-ID", "CSeq", "Content-Length"];

/// Request methods used by the call flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
}

impl Method {
    // ---
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s {
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            other => Err(CallError::MalformedMessage(format!(
                "unsupported method: {other}"
            ))),
        }
    }
}

/// Parsed `CSeq` header: sequence number plus the method it numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(number: u32, method: Method) -> Self {
        Self { number, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.method)
    }
}

impl FromStr for CSeq {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let mut parts = s.split_whitespace();
        let (Some(number), Some(method), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CallError::MalformedMessage(format!("invalid CSeq: {s}")));
        };

        let number = number
            .parse()
            .map_err(|_| CallError::MalformedMessage(format!("invalid CSeq number: {number}")))?;

        Ok(Self {
            number,
            method: method.parse()?,
        })
    }
}

/// Ordered header list with case-insensitive lookup.
///
/// `Content-Length` is never stored; it is derived from the body when the
/// message is serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping insertion order.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        // ---
        if name.eq_ignore_ascii_case("Content-Length") {
            return;
        }
        self.entries.push((name.to_string(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        // ---
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Like [`get`](Self::get) but a missing header is a parse error.
    pub fn require(&self, name: &str) -> Result<&str> {
        // ---
        self.get(name)
            .ok_or_else(|| CallError::MalformedMessage(format!("missing {name} header")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A control request: `METHOD target SIP/2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub headers: Headers,
    pub body: Option<String>,
}

/// A control response: `SIP/2.0 status reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl Response {
    // ---
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Either kind of control message.
///
/// Wire format:
///
/// ```text
/// start-line CRLF
/// *(Header: Value CRLF)
/// Content-Length: <len(body)> CRLF
/// CRLF
/// [body]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    // ---
    pub fn headers(&self) -> &Headers {
        // ---
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }

    pub fn body(&self) -> Option<&str> {
        // ---
        match self {
            SipMessage::Request(r) => r.body.as_deref(),
            SipMessage::Response(r) => r.body.as_deref(),
        }
    }

    /// The `Call-ID` header value, if present.
    pub fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    /// Parsed `CSeq` header.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedMessage`] if the header is missing or invalid.
    pub fn cseq(&self) -> Result<CSeq> {
        self.headers().require("CSeq")?.parse()
    }

    /// Short label for logging, e.g. `INVITE` or `200 OK`.
    pub fn summary(&self) -> String {
        // ---
        match self {
            SipMessage::Request(r) => r.method.to_string(),
            SipMessage::Response(r) => format!("{} {}", r.status, r.reason),
        }
    }

    /// Serializes to the text wire format.
    ///
    /// `Content-Length` is always emitted last and always equals the body's
    /// byte length (0 when there is no body).
    pub fn serialize(&self) -> String {
        // ---
        let mut out = match self {
            SipMessage::Request(r) => format!("{} {} {}\r\n", r.method, r.target, PROTOCOL),
            SipMessage::Response(r) => format!("{} {} {}\r\n", PROTOCOL, r.status, r.reason),
        };

        for (name, value) in self.headers().iter() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }

        let body = self.body().unwrap_or("");
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        out.push_str(body);
        out
    }

    /// Parses one datagram.
    ///
    /// Header lookups are case-insensitive. The body is the `Content-Length`
    /// bytes following the blank line; trailing bytes beyond it are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MalformedMessage`] if the datagram is not UTF-8,
    /// the start line is malformed, a required header is missing, or the
    /// body is shorter than `Content-Length`.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        // ---
        let text = std::str::from_utf8(raw)
            .map_err(|_| CallError::MalformedMessage("not valid UTF-8".into()))?;

        let (head, rest) = split_head(text)
            .ok_or_else(|| CallError::MalformedMessage("missing blank line after headers".into()))?;

        let mut lines = head.lines();
        let start_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| CallError::MalformedMessage("empty message".into()))?;

        let mut headers = Headers::new();
        let mut content_length = None;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CallError::MalformedMessage(format!("invalid header line: {line}")))?;
            let (name, value) = (name.trim(), value.trim());

            if name.eq_ignore_ascii_case("Content-Length") {
                let len: usize = value.parse().map_err(|_| {
                    CallError::MalformedMessage(format!("invalid Content-Length: {value}"))
                })?;
                content_length = Some(len);
            } else {
                headers.push(name, value);
            }
        }

        for name in REQUIRED_HEADERS {
            if name != "Content-Length" {
                headers.require(name)?;
            }
        }
        let content_length = content_length
            .ok_or_else(|| CallError::MalformedMessage("missing Content-Length header".into()))?;

        if rest.len() < content_length {
            return Err(CallError::MalformedMessage(format!(
                "body truncated: Content-Length {} but {} bytes present",
                content_length,
                rest.len()
            )));
        }
        let body = rest
            .get(..content_length)
            .ok_or_else(|| CallError::MalformedMessage("Content-Length splits a character".into()))?;
        let body = (!body.is_empty()).then(|| body.to_string());

        parse_start_line(start_line, headers, body)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl From<Request> for SipMessage {
    fn from(r: Request) -> Self {
        SipMessage::Request(r)
    }
}

impl From<Response> for SipMessage {
    fn from(r: Response) -> Self {
        SipMessage::Response(r)
    }
}

/// Standard reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    // ---
    match status {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        _ => "Unknown Status",
    }
}

/// Splits at the first blank line, accepting bare LF line endings.
fn split_head(text: &str) -> Option<(&str, &str)> {
    // ---
    if let Some(pos) = text.find("\r\n\r\n") {
        return Some((&text[..pos], &text[pos + 4..]));
    }
    text.find("\n\n").map(|pos| (&text[..pos], &text[pos + 2..]))
}

fn parse_start_line(line: &str, headers: Headers, body: Option<String>) -> Result<SipMessage> {
    // ---
    if let Some(status_part) = line.strip_prefix(PROTOCOL) {
        let mut parts = status_part.trim_start().splitn(2, ' ');
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|s| (100..700).contains(s))
            .ok_or_else(|| CallError::MalformedMessage(format!("invalid status line: {line}")))?;
        let reason = parts.next().unwrap_or("").trim().to_string();

        return Ok(SipMessage::Response(Response {
            status,
            reason,
            headers,
            body,
        }));
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || parts[2] != PROTOCOL {
        return Err(CallError::MalformedMessage(format!(
            "invalid request line: {line}"
        )));
    }

    Ok(SipMessage::Request(Request {
        method: parts[0].parse()?,
        target: parts[1].to_string(),
        headers,
        body,
    }))
}
