//! Line-oriented wire protocol.
//!
//! Requests look like `HIT method=GET path="/some path"` and responses are a
//! single `OK ...` or `ERR ...` line.

mod codec;

pub use codec::{
    format_hit, parse_command, parse_operation, read_string, Command, ProtocolError, Response,
    Status,
};
