use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Window counters live in the store's database so a single durable backend
/// carries all shared state. Keys are `"<class>|<client>"`.
pub(crate) const RATE_WINDOWS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("rate_windows");

/// Operation class under limit. Each class gets an independent window, so a
/// burst of claims cannot starve store throughput or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Store,
    Claim,
    Peek,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Store => "store",
            OpClass::Claim => "claim",
            OpClass::Peek => "peek",
        }
    }
}

/// Capacity of one operation class: at most `max_requests` per trailing `window`.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub max_requests: u32,
    pub window: Duration,
}

/// Per-class limits. Store is throttled harder — it is the expensive,
/// abuse-prone operation (arbitrary payload write).
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub store: ClassLimit,
    pub claim: ClassLimit,
    pub peek: ClassLimit,
}

impl Default for RatePolicy {
    fn default() -> Self {
        let window = Duration::from_secs(10);
        Self {
            store: ClassLimit {
                max_requests: 10,
                window,
            },
            claim: ClassLimit {
                max_requests: 20,
                window,
            },
            peek: ClassLimit {
                max_requests: 20,
                window,
            },
        }
    }
}

impl RatePolicy {
    fn limit(&self, class: OpClass) -> ClassLimit {
        match class {
            OpClass::Store => self.store,
            OpClass::Claim => self.claim,
            OpClass::Peek => self.peek,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RateWindow {
    /// Unix milliseconds when the current window opened.
    started_at: i64,
    count: u32,
}

/// Sliding-window counter keyed by `(client identity, operation class)`.
///
/// Pure admission gate: a throttled request is rejected before any secret
/// state is touched. The increment-and-compare runs in one write transaction,
/// so concurrent requests from replicated handlers count correctly.
#[derive(Clone)]
pub struct RateLimiter {
    db: Arc<Database>,
    policy: RatePolicy,
}

impl RateLimiter {
    pub fn new(db: Arc<Database>, policy: RatePolicy) -> Self {
        Self { db, policy }
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    /// Returns true when the request is admitted. Denied requests still count
    /// against the window — a client hammering past its budget stays denied.
    pub fn allow(&self, client: &str, class: OpClass) -> Result<bool> {
        let limit = self.policy.limit(class);
        let now = Self::now_ms();
        let key = format!("{}|{}", class.as_str(), client);

        let write_txn = self.db.begin_write()?;
        let allowed = {
            let mut table = write_txn.open_table(RATE_WINDOWS)?;

            let existing: Option<Vec<u8>> =
                table.get(key.as_str())?.map(|guard| guard.value().to_vec());

            let mut window = match existing {
                Some(bytes) => decode(&bytes)?,
                None => RateWindow {
                    started_at: now,
                    count: 0,
                },
            };

            if now - window.started_at >= limit.window.as_millis() as i64 {
                window.started_at = now;
                window.count = 0;
            }
            window.count = window.count.saturating_add(1);

            let bytes = encode(&window)?;
            table.insert(key.as_str(), bytes.as_slice())?;

            window.count <= limit.max_requests
        };
        write_txn.commit()?;

        if !allowed {
            debug!(client = %client, class = class.as_str(), "request throttled");
        }
        Ok(allowed)
    }

    /// Drop windows that aged past their class duration. Called by the
    /// store's background sweep.
    pub fn prune(&self) -> Result<usize> {
        let now = Self::now_ms();

        let stale: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(RATE_WINDOWS)?;
            let mut keys = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let key = k.value().to_owned();
                let window = decode(v.value())?;
                let limit = match key.split('|').next() {
                    Some("store") => self.policy.store,
                    Some("claim") => self.policy.claim,
                    _ => self.policy.peek,
                };
                if now - window.started_at >= limit.window.as_millis() as i64 {
                    keys.push(key);
                }
            }
            keys
        };

        if stale.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RATE_WINDOWS)?;
            for key in &stale {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(stale.len())
    }
}

fn encode(window: &RateWindow) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(window, bincode::config::standard())
        .context("bincode encode rate window")
}

fn decode(bytes: &[u8]) -> Result<RateWindow> {
    let (window, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode rate window")?;
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::crypto::generate_key;
    use crate::store::Store;
    use tempfile::tempdir;

    fn make_limiter(policy: RatePolicy) -> (RateLimiter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db"), generate_key()).unwrap();
        (RateLimiter::new(store.database(), policy), dir)
    }

    fn tight_policy(max_requests: u32, window: Duration) -> RatePolicy {
        let limit = ClassLimit {
            max_requests,
            window,
        };
        RatePolicy {
            store: limit,
            claim: limit,
            peek: limit,
        }
    }

    #[test]
    fn throttles_after_capacity() {
        let (rl, _dir) = make_limiter(tight_policy(3, Duration::from_secs(60)));
        for _ in 0..3 {
            assert!(rl.allow("1.2.3.4", OpClass::Store).unwrap());
        }
        assert!(!rl.allow("1.2.3.4", OpClass::Store).unwrap());
    }

    #[test]
    fn window_elapse_readmits() {
        let (rl, _dir) = make_limiter(tight_policy(1, Duration::from_millis(100)));
        assert!(rl.allow("c", OpClass::Claim).unwrap());
        assert!(!rl.allow("c", OpClass::Claim).unwrap());
        std::thread::sleep(Duration::from_millis(150));
        assert!(rl.allow("c", OpClass::Claim).unwrap());
    }

    #[test]
    fn classes_do_not_interfere() {
        let (rl, _dir) = make_limiter(tight_policy(1, Duration::from_secs(60)));
        assert!(rl.allow("c", OpClass::Store).unwrap());
        assert!(!rl.allow("c", OpClass::Store).unwrap());
        // Same client, different class: independent window.
        assert!(rl.allow("c", OpClass::Claim).unwrap());
        assert!(rl.allow("c", OpClass::Peek).unwrap());
    }

    #[test]
    fn clients_do_not_interfere() {
        let (rl, _dir) = make_limiter(tight_policy(1, Duration::from_secs(60)));
        assert!(rl.allow("a", OpClass::Store).unwrap());
        assert!(!rl.allow("a", OpClass::Store).unwrap());
        assert!(rl.allow("b", OpClass::Store).unwrap());
    }

    #[test]
    fn default_policy_throttles_store_harder() {
        let policy = RatePolicy::default();
        assert!(policy.store.max_requests < policy.claim.max_requests);
    }

    #[test]
    fn prune_drops_stale_windows() {
        let (rl, _dir) = make_limiter(tight_policy(5, Duration::from_millis(50)));
        rl.allow("a", OpClass::Store).unwrap();
        rl.allow("b", OpClass::Peek).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(rl.prune().unwrap(), 2);
        assert_eq!(rl.prune().unwrap(), 0);
    }
}
