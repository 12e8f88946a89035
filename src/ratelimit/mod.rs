//! Quota rules and credit accounting.

mod backend;
mod bucket;
mod loader;
mod memory;
mod redis_backend;
mod rules;

pub use backend::{BackendError, CreditBackend, CreditStatus};
pub use bucket::{BucketKey, DEFAULT_KEY_PREFIX};
pub use loader::{RuleDefinition, RuleDocument};
pub use memory::MemoryBackend;
pub use redis_backend::{RedisBackend, RedisBackendConfig};
pub use rules::{
    describe_operation, parse_glob, ConfigStore, MatchPolicy, Operation, Quantity, Rule,
    RuleError, RuleSpec, ValuePattern, MAX_RESET_SECONDS,
};
