//! Command parsing and response serialization.

use std::fmt;

use thiserror::Error;

use crate::ratelimit::{CreditStatus, Operation};

/// Errors produced while parsing a request line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The line could not be tokenized.
    #[error("{0}")]
    Malformed(String),

    /// The command keyword is not one we serve.
    #[error("Unrecognized command: {0}")]
    UnknownCommand(String),
}

impl ProtocolError {
    fn malformed(message: impl Into<String>) -> Self {
        ProtocolError::Malformed(message.into())
    }

    /// The error code reported to clients and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownCommand(_) => "unknown-command",
            ProtocolError::Malformed(_) => "unknown",
        }
    }
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Consume one unit of credit for the operation.
    Hit(Operation),
}

/// Response status literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Err => "ERR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single response line, before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Err,
            message: message.into(),
        }
    }

    /// An `ERR` response carrying a protocol error code and quoted message.
    pub fn protocol_error(code: &str, message: &str) -> Self {
        Self::error(format!("{} \"{}\"", code, message))
    }

    /// A generic internal error.
    pub fn internal_error(message: impl fmt::Display) -> Self {
        Self::error(format!("Internal Error: {}", message))
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Err
    }

    /// Serialize to a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        format!("{} {}\n", self.status, self.message)
    }
}

/// Render the success message for a HIT.
pub fn format_hit(status: &CreditStatus) -> String {
    format!(
        "{} {} {}",
        status.is_allowed, status.current_credit, status.next_reset_seconds
    )
}

enum Expect {
    Char(char),
    Whitespace,
}

/// Read one optionally-quoted string from the front of `input`.
///
/// A quoted string ends at the next quote mark. An unquoted string ends at
/// whitespace, `=`, or the end of input. Returns the value and the unparsed
/// remainder.
pub fn read_string(input: &str) -> Result<(&str, &str), ProtocolError> {
    if let Some(inner) = input.strip_prefix('"') {
        let end = inner
            .find('"')
            .ok_or_else(|| ProtocolError::malformed("Unexpected end of quoted string."))?;
        return Ok((&inner[..end], &inner[end + 1..]));
    }

    let end = input
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(input.len());
    Ok((&input[..end], &input[end..]))
}

fn consume_char(input: &str, expect: Expect) -> Result<&str, ProtocolError> {
    let first = input
        .chars()
        .next()
        .ok_or_else(|| ProtocolError::malformed("Unexpected end of input string."))?;

    let (matches, wanted) = match expect {
        Expect::Char(c) => (first == c, format!("'{}'", c)),
        Expect::Whitespace => (first.is_whitespace(), "whitespace".to_string()),
    };
    if !matches {
        return Err(ProtocolError::malformed(format!(
            "Expected {}, found '{}'",
            wanted, first
        )));
    }

    Ok(&input[first.len_utf8()..])
}

/// Parse zero or more `key=value` pairs into an operation.
///
/// Later occurrences of a key replace earlier ones.
pub fn parse_operation(input: &str) -> Result<Operation, ProtocolError> {
    let mut s = input.trim();
    let mut operation = Operation::new();

    while !s.is_empty() {
        let (key, remain) = read_string(s)?;
        s = consume_char(remain, Expect::Char('='))?;

        let (value, remain) = read_string(s)?;
        s = remain;

        operation.insert(key.to_string(), value.to_string());

        if !s.is_empty() {
            s = consume_char(s, Expect::Whitespace)?;
        }
        s = s.trim_start();
    }

    Ok(operation)
}

/// Parse a request line into a [`Command`].
pub fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let (name, remain) = read_string(line)?;
    let name = name.to_uppercase();

    match name.as_str() {
        "HIT" => Ok(Command::Hit(parse_operation(remain.trim())?)),
        _ => Err(ProtocolError::UnknownCommand(name)),
    }
}
