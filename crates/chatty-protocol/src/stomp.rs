//! Minimal STOMP 1.2 frame codec.
//!
//! Covers exactly the subset the backend's broker speaks: client frames
//! `CONNECT`, `SUBSCRIBE`, `UNSUBSCRIBE`, `SEND`, `DISCONNECT` and server
//! frames `CONNECTED`, `MESSAGE`, `ERROR`, `RECEIPT`. Heartbeats are bare
//! newline frames and are handled outside the codec via [`is_heartbeat`].

use thiserror::Error;

/// A heartbeat frame: a single end-of-line.
pub const HEARTBEAT: &str = "\n";

/// Frame parse errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame contained no command line.
    #[error("empty frame")]
    Empty,

    /// A header line had no `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// Command is not part of the supported STOMP subset.
    #[error("unknown STOMP command: {0:?}")]
    UnknownCommand(String),
}

/// STOMP commands in the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Error,
    Receipt,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Error => "ERROR",
            Self::Receipt => "RECEIPT",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "CONNECTED" => Ok(Self::Connected),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "SEND" => Ok(Self::Send),
            "MESSAGE" => Ok(Self::Message),
            "ERROR" => Ok(Self::Error),
            "RECEIPT" => Ok(Self::Receipt),
            "DISCONNECT" => Ok(Self::Disconnect),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

/// A decoded STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, if present. STOMP specifies that repeated
    /// headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `CONNECT` frame with the client's heartbeat offer in milliseconds
    /// (outgoing, incoming).
    pub fn connect(host: &str, heartbeat_out_ms: u64, heartbeat_in_ms: u64) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_out_ms},{heartbeat_in_ms}"))
    }

    /// `SUBSCRIBE` with auto acknowledgement, the only mode the backend
    /// broker supports.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    /// `SEND` with a JSON body.
    pub fn send(destination: &str, json_body: String) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", json_body.len().to_string())
            .body(json_body)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// The `heart-beat` header as (sx, sy) milliseconds, if present and
    /// well-formed.
    pub fn heart_beat(&self) -> Option<(u64, u64)> {
        let raw = self.get("heart-beat")?;
        let (sx, sy) = raw.split_once(',')?;
        Some((sx.trim().parse().ok()?, sy.trim().parse().ok()?))
    }

    /// Serialize to the on-wire text representation, NUL terminated.
    pub fn encode(&self) -> String {
        let escape = self.command != Command::Connect;
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse a frame from its on-wire text representation.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let raw = raw.trim_end_matches('\0');
        // Leading end-of-lines are permitted between frames.
        let raw = raw.trim_start_matches(['\r', '\n']);

        let mut lines = raw.split('\n');
        let command_line = lines.next().ok_or(FrameError::Empty)?;
        let command = Command::parse(command_line.trim_end_matches('\r'))?;
        let escaped = command != Command::Connected;

        let mut headers = Vec::new();
        let mut consumed = command_line.len() + 1;
        for line in lines {
            let line_len = line.len() + 1;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                consumed += line_len;
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escaped {
                headers.push((unescape_header(name), unescape_header(value)));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
            consumed += line_len;
        }

        let body = raw.get(consumed..).unwrap_or("").to_string();
        Ok(Self {
            command,
            headers,
            body,
        })
    }
}

/// Whether a raw websocket text payload is a STOMP heartbeat.
pub fn is_heartbeat(raw: &str) -> bool {
    raw.is_empty() || raw == "\n" || raw == "\r\n"
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
