//! Key-value cache primitives the distributed backend is built on.
//!
//! [`CacheClient`] is the narrow surface the lock protocol needs: an atomic
//! create-if-absent with expiry, plus compare-and-swap replace and delete.
//! [`RedisCache`] implements it over a small pool of blocking Redis
//! connections; compare-and-swap runs as Lua scripts so each check-then-act
//! is a single server-side step.

use crate::config::RedisConfig;
use crate::error::{LockError, Result};
use redis::{Client, Connection, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Minimal atomic key-value surface for lock records.
pub trait CacheClient: Send + Sync {
    /// Store `value` under `key` with expiry `ttl` unless the key exists.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrite `key` with `value` and expiry `ttl` only if it still holds `expected`.
    fn replace_if_equals(&self, key: &str, expected: &str, value: &str, ttl: Duration)
    -> Result<bool>;

    /// Delete `key` only if it still holds `expected`.
    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Every key starting with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn ping(&self) -> Result<()>;
}

impl<T: CacheClient + ?Sized> CacheClient for std::sync::Arc<T> {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn replace_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        (**self).replace_if_equals(key, expected, value, ttl)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        (**self).delete_if_equals(key, expected)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).scan_prefix(prefix)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}

const REPLACE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// Redis expiry in milliseconds, never zero (Redis rejects `PX 0`).
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Blocking Redis client with a bounded pool of idle connections.
pub struct RedisCache {
    clients: Vec<Client>,
    idle: Mutex<Vec<Connection>>,
    pool_size: usize,
    conn_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    replace_script: redis::Script,
    delete_script: redis::Script,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("endpoints", &self.clients.len())
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl RedisCache {
    /// Build a client for every configured address. No connection is made yet.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(LockError::Config(
                "redis.addresses must contain at least one host:port".to_string(),
            ));
        }

        let clients = config
            .addresses
            .iter()
            .map(|address| {
                let info = connection_info(address, config)?;
                Client::open(info).map_err(|e| {
                    LockError::Config(format!("invalid redis address '{}': {}", address, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            clients,
            idle: Mutex::new(Vec::new()),
            pool_size: config.pool_size as usize,
            conn_timeout: Duration::from_millis(config.conn_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            replace_script: redis::Script::new(REPLACE_IF_EQUALS),
            delete_script: redis::Script::new(DELETE_IF_EQUALS),
        })
    }

    fn unavailable(reason: impl std::fmt::Display) -> LockError {
        LockError::unavailable("distributed", reason)
    }

    /// Take an idle connection or open a new one, trying endpoints in order.
    fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().unwrap_or_else(|p| p.into_inner()).pop() {
            return Ok(conn);
        }

        let mut last_error = None;
        for client in &self.clients {
            match client.get_connection_with_timeout(self.conn_timeout) {
                Ok(conn) => {
                    conn.set_read_timeout(Some(self.read_timeout))
                        .and_then(|_| conn.set_write_timeout(Some(self.write_timeout)))
                        .map_err(Self::unavailable)?;
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(error = %e, "redis endpoint unreachable, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(Self::unavailable(match last_error {
            Some(e) => format!("failed to connect: {}", e),
            None => "no endpoints configured".to_string(),
        }))
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() < self.pool_size {
            idle.push(conn);
        }
    }

    /// Run `op` on a pooled connection. Connections that saw an error are dropped.
    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut conn = self.checkout()?;
        match op(&mut conn) {
            Ok(value) => {
                self.checkin(conn);
                Ok(value)
            }
            Err(e) => Err(Self::unavailable(e)),
        }
    }
}

fn connection_info(address: &str, config: &RedisConfig) -> Result<ConnectionInfo> {
    let (host, port) = address
        .rsplit_once(':')
        .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port)))
        .ok_or_else(|| {
            LockError::Config(format!(
                "redis address '{}' must have the form host:port",
                address
            ))
        })?;

    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            db: config.db,
            username: config.username.clone(),
            password: config.password.clone(),
            ..Default::default()
        },
    })
}

impl CacheClient for RedisCache {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn replace_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let replaced: i64 = self.with_connection(|conn| {
            self.replace_script
                .key(key)
                .arg(expected)
                .arg(value)
                .arg(ttl_millis(ttl))
                .invoke(conn)
        })?;
        Ok(replaced == 1)
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let deleted: i64 = self.with_connection(|conn| {
            self.delete_script.key(key).arg(expected).invoke(conn)
        })?;
        Ok(deleted == 1)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", prefix);
        self.with_connection(|conn| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(conn)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn ping(&self) -> Result<()> {
        let reply: String = self.with_connection(|conn| redis::cmd("PING").query(conn))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(Self::unavailable(format!("unexpected PING reply '{}'", reply)))
        }
    }
}
