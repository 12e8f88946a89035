//! Redis-backed credit backend.
//!
//! The check-and-decrement runs as a Lua script on the Redis server, so it is
//! atomic with respect to every other client of the same Redis instance. The
//! script is loaded once by [`CreditBackend::initialize`] and invoked by SHA
//! on every hit.

use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, Value};
use tracing::{debug, info, trace};

use super::backend::{precheck, BackendError, CreditBackend, CreditStatus};
use super::bucket::{BucketKey, DEFAULT_KEY_PREFIX};
use super::rules::Operation;

/// Atomic hit against one bucket.
///
/// KEYS[1] is the bucket, ARGV[1] the interval in seconds and ARGV[2] the
/// value a fresh bucket starts at (the limit minus this hit). Returns
/// `{allowed, credit, ttl}`.
const HIT_SCRIPT: &str = r#"
local key = KEYS[1]
local reset_seconds = tonumber(ARGV[1])
local initial_value = tonumber(ARGV[2])

local current = redis.call('GET', key)
if not current then
  redis.call('SET', key, initial_value, 'EX', reset_seconds)
  return {1, initial_value, reset_seconds}
end

current = tonumber(current)
local allowed = 0
if current > 0 then
  allowed = 1
  current = redis.call('DECR', key)
end

return {allowed, current, redis.call('TTL', key)}
"#;

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub url: String,
    /// Namespace prepended to every bucket key
    pub key_prefix: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Credit backend sharing buckets through Redis.
pub struct RedisBackend {
    connection: ConnectionManager,
    config: RedisBackendConfig,
    script_sha: RwLock<Option<String>>,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .field("script_sha", &*self.script_sha.read())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self, BackendError> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis");

        Ok(Self {
            connection,
            config,
            script_sha: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &RedisBackendConfig {
        &self.config
    }
}

/// Decode the `{allowed, credit, ttl}` reply of the hit script.
fn parse_reply(reply: Value) -> Result<CreditStatus, BackendError> {
    match reply {
        Value::Array(items) => match items.as_slice() {
            [Value::Int(allowed), Value::Int(credit), Value::Int(ttl)] => Ok(CreditStatus {
                is_allowed: *allowed != 0,
                current_credit: *credit,
                next_reset_seconds: *ttl,
            }),
            _ => Err(BackendError::UnexpectedReply(format!("{:?}", items))),
        },
        other => Err(BackendError::UnexpectedReply(format!("{:?}", other))),
    }
}

#[async_trait]
impl CreditBackend for RedisBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(HIT_SCRIPT)
            .query_async(&mut connection)
            .await?;

        debug!(sha = %sha, "Loaded hit script");
        *self.script_sha.write() = Some(sha);
        Ok(())
    }

    async fn hit(
        &self,
        rule_operation: &Operation,
        actor: &str,
        credit_limit: i64,
        reset_seconds: i64,
    ) -> Result<CreditStatus, BackendError> {
        let sha = self.script_sha.read().clone();
        if let Some(status) = precheck(sha.is_some(), credit_limit, reset_seconds)? {
            return Ok(status);
        }
        let sha = sha.ok_or(BackendError::NotInitialized)?;

        let key = BucketKey::new(rule_operation, actor, credit_limit, reset_seconds)
            .to_store_key(&self.config.key_prefix);

        trace!(sha = %sha, key = %key, reset_seconds, credit_limit, "EVALSHA hit");

        let mut connection = self.connection.clone();
        let reply: Value = redis::cmd("EVALSHA")
            .arg(&sha)
            .arg(1)
            .arg(&key)
            .arg(reset_seconds)
            .arg(credit_limit - 1)
            .query_async(&mut connection)
            .await?;

        parse_reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let reply = Value::Array(vec![Value::Int(1), Value::Int(42), Value::Int(55)]);
        assert_eq!(
            parse_reply(reply).unwrap(),
            CreditStatus {
                is_allowed: true,
                current_credit: 42,
                next_reset_seconds: 55,
            }
        );

        let reply = Value::Array(vec![Value::Int(0), Value::Int(0), Value::Int(3)]);
        assert!(!parse_reply(reply).unwrap().is_allowed);
    }

    #[test]
    fn test_parse_reply_unexpected_shape() {
        assert!(matches!(
            parse_reply(Value::Nil),
            Err(BackendError::UnexpectedReply(_))
        ));
        assert!(matches!(
            parse_reply(Value::Array(vec![Value::Int(1), Value::Int(2)])),
            Err(BackendError::UnexpectedReply(_))
        ));
        assert!(matches!(
            parse_reply(Value::Array(vec![
                Value::Int(1),
                Value::Nil,
                Value::Int(2)
            ])),
            Err(BackendError::UnexpectedReply(_))
        ));
    }
}
