//! Divvy - Quota-based Admission Control
//!
//! This crate implements a small server that decides whether an operation,
//! described as a set of key/value attributes, may proceed. Clients speak a
//! line-oriented text protocol over TCP; operations are matched against an
//! ordered list of quota rules and billed against per-bucket credit held in
//! Redis or in process memory.

pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod ratelimit;
pub mod server;
