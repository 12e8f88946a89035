//! Protocol server: listener, per-connection dispatch and request handling.

mod dispatcher;
mod listener;
mod service;

pub use dispatcher::{Dispatcher, Handler};
pub use listener::{Server, DEFAULT_PORT};
pub use service::DivvyService;
