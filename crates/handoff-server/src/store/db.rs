use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::time;
use tracing::{debug, info, warn};

use super::crypto::EncryptionKey;
use super::model::{ClaimOutcome, NewSecret, PeekOutcome, PutOutcome, Secret, SecretRecord};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Thread-safe handle to the redb store.
///
/// Every operation runs inside a single write transaction. redb serializes
/// writers, so a claim's read-and-remove is indivisible with respect to any
/// other claim, peek, insert, or revoke on the same identifier — two racing
/// claims can never both observe the payload.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    key: Arc<EncryptionKey>,
}

impl Store {
    /// Open (or create) the database at `path`, using `key` to encrypt payloads.
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist before the first real transaction.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(crate::ratelimit::RATE_WINDOWS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    /// Handle to the underlying database, for collaborators that keep their
    /// own tables in it (the rate limiter).
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Insert a secret only if `id` is not occupied by a live record.
    ///
    /// An expired-but-unswept occupant counts as absent and is evicted.
    /// Identifiers are random, so overwriting a dead slot cannot resurrect
    /// old data — the old ciphertext is replaced in the same transaction.
    pub fn put_if_absent(&self, id: &str, new: &NewSecret) -> Result<PutOutcome> {
        let now = Self::now();
        let expires_at = now + new.ttl_seconds as i64;

        let (payload_encrypted, nonce) =
            super::crypto::encrypt(&self.key, &new.payload).context("encrypt payload")?;

        let record = SecretRecord {
            payload_encrypted,
            nonce,
            kind: new.kind,
            filename: new.filename.clone(),
            mimetype: new.mimetype.clone(),
            created_at: now,
            expires_at,
            peek_allowed: new.peek_allowed,
            view_limit: new.view_limit,
            view_count: 0,
        };

        let bytes = encode(&record)?;
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Read the raw bytes and immediately clone them so the AccessGuard
            // (which borrows `table`) is dropped before any mutation.
            let existing: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            let occupied = match existing {
                Some(raw) => !decode(&raw)?.is_expired(now),
                None => false,
            };

            if occupied {
                PutOutcome::Collision
            } else {
                table.insert(id, bytes.as_slice())?;
                PutOutcome::Stored { expires_at }
            }
        };
        write_txn.commit()?;

        if outcome == PutOutcome::Collision {
            warn!(id = %id, "identifier collision on insert");
        } else {
            debug!(id = %id, expires_at, "stored secret");
        }
        Ok(outcome)
    }

    /// Atomically read and remove a secret. The first claim wins; every later
    /// one — including a concurrent loser — observes `NotFound`.
    ///
    /// Wall-clock expiry is re-checked here, so a record the sweep has not yet
    /// evicted is still unclaimable past its TTL.
    pub fn claim(&self, id: &str) -> Result<ClaimOutcome> {
        let now = Self::now();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            let raw: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw {
                None => ClaimOutcome::NotFound,
                Some(bytes) => {
                    let record = decode(&bytes)?;

                    if record.is_expired(now) {
                        table.remove(id)?;
                        debug!(id = %id, "lazy-evicted expired secret");
                        ClaimOutcome::NotFound
                    } else {
                        let secret = decrypt_record(&self.key, &record)?;
                        table.remove(id)?;
                        debug!(id = %id, "claimed and destroyed secret");
                        ClaimOutcome::Claimed(secret)
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Non-destructive preview. The read and the view-counter increment happen
    /// in one transaction, so concurrent peeks cannot exceed the view budget.
    pub fn peek(&self, id: &str) -> Result<PeekOutcome> {
        let now = Self::now();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            let raw: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw {
                None => PeekOutcome::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if record.is_expired(now) {
                        table.remove(id)?;
                        debug!(id = %id, "lazy-evicted expired secret");
                        PeekOutcome::NotFound
                    } else if !record.peek_allowed || record.peeks_exhausted() {
                        PeekOutcome::Denied
                    } else {
                        record.view_count += 1;
                        let secret = decrypt_record(&self.key, &record)?;
                        let views_remaining = record.view_limit - record.view_count;

                        let updated = encode(&record)?;
                        table.insert(id, updated.as_slice())?;
                        PeekOutcome::Peeked {
                            secret,
                            views_remaining,
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Unconditional delete for sender-initiated early destruction.
    /// Returns true only when a live record existed — an expired occupant is
    /// removed but reported as already gone.
    pub fn revoke(&self, id: &str) -> Result<bool> {
        let now = Self::now();

        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let removed = match table.remove(id)? {
                None => false,
                Some(guard) => {
                    let record = decode(&guard.value().to_vec())?;
                    !record.is_expired(now)
                }
            };
            removed
        };
        write_txn.commit()?;

        if existed {
            info!(id = %id, "revoked secret");
        }
        Ok(existed)
    }

    /// Remove all expired secrets. Returns the removed identifiers.
    pub fn prune(&self) -> Result<Vec<String>> {
        let now = Self::now();

        // Collect expired ids in a read pass first.
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                if decode(v.value())?.is_expired(now) {
                    ids.push(k.value().to_owned());
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(vec![]);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            for id in &expired {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;

        info!(removed = expired.len(), "pruned expired secrets");
        Ok(expired)
    }

    /// Spawn a background Tokio task that evicts expired secrets and stale
    /// rate windows every `interval`.
    pub fn spawn_sweep(self, interval: Duration, limiter: crate::ratelimit::RateLimiter) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune() {
                    warn!(error = %e, "background sweep error");
                }
                if let Err(e) = limiter.prune() {
                    warn!(error = %e, "rate window sweep error");
                }
            }
        });
    }
}

fn decrypt_record(key: &EncryptionKey, record: &SecretRecord) -> Result<Secret> {
    let payload = super::crypto::decrypt(key, &record.payload_encrypted, &record.nonce)
        .context("decrypt payload")?;
    Ok(Secret {
        payload,
        kind: record.kind,
        filename: record.filename.clone(),
        mimetype: record.mimetype.clone(),
        expires_at: record.expires_at,
    })
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode")
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::SecretKind;
    use tempfile::tempdir;

    fn make_store() -> (Store, tempfile::TempDir) {
        let key = super::super::crypto::generate_key();
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path, key).unwrap();
        (store, dir)
    }

    fn text_secret(payload: &str, ttl_seconds: u64) -> NewSecret {
        NewSecret {
            payload: payload.as_bytes().to_vec(),
            kind: SecretKind::Text,
            filename: None,
            mimetype: None,
            ttl_seconds,
            peek_allowed: false,
            view_limit: 0,
        }
    }

    #[test]
    fn claim_destroys() {
        let (s, _dir) = make_store();
        assert!(matches!(
            s.put_if_absent("ab12cd", &text_secret("hello", 3600)).unwrap(),
            PutOutcome::Stored { .. }
        ));

        match s.claim("ab12cd").unwrap() {
            ClaimOutcome::Claimed(secret) => {
                assert_eq!(secret.payload, b"hello");
                assert_eq!(secret.kind, SecretKind::Text);
            }
            other => panic!("expected Claimed, got {other:?}"),
        }

        // Second claim must observe NotFound — the record is gone.
        assert_eq!(s.claim("ab12cd").unwrap(), ClaimOutcome::NotFound);
    }

    #[test]
    fn put_if_absent_detects_live_occupant() {
        let (s, _dir) = make_store();
        s.put_if_absent("occupied", &text_secret("first", 3600))
            .unwrap();
        assert_eq!(
            s.put_if_absent("occupied", &text_secret("second", 3600))
                .unwrap(),
            PutOutcome::Collision
        );

        // The original payload is untouched.
        match s.claim("occupied").unwrap() {
            ClaimOutcome::Claimed(secret) => assert_eq!(secret.payload, b"first"),
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[test]
    fn dead_occupant_counts_as_absent() {
        let (s, _dir) = make_store();
        // TTL = 0 means already expired.
        s.put_if_absent("slot", &text_secret("old", 0)).unwrap();
        assert!(matches!(
            s.put_if_absent("slot", &text_secret("new", 3600)).unwrap(),
            PutOutcome::Stored { .. }
        ));
        match s.claim("slot").unwrap() {
            ClaimOutcome::Claimed(secret) => assert_eq!(secret.payload, b"new"),
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[test]
    fn expired_secret_is_unclaimable() {
        let (s, _dir) = make_store();
        s.put_if_absent("gone", &text_secret("value", 0)).unwrap();
        assert_eq!(s.claim("gone").unwrap(), ClaimOutcome::NotFound);
    }

    #[test]
    fn claim_after_ttl_elapses() {
        let (s, _dir) = make_store();
        s.put_if_absent("brief", &text_secret("value", 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(s.claim("brief").unwrap(), ClaimOutcome::NotFound);
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (s, _dir) = make_store();
        s.put_if_absent("raced", &text_secret("prize", 3600))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.claim("raced").unwrap())
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == ClaimOutcome::NotFound)
                .count(),
            7
        );
    }

    #[test]
    fn revoke_then_claim_not_found() {
        let (s, _dir) = make_store();
        s.put_if_absent("rv", &text_secret("value", 3600)).unwrap();
        assert!(s.revoke("rv").unwrap());
        assert_eq!(s.claim("rv").unwrap(), ClaimOutcome::NotFound);
        // Revoking again reports not found.
        assert!(!s.revoke("rv").unwrap());
    }

    #[test]
    fn revoke_expired_reports_not_found() {
        let (s, _dir) = make_store();
        s.put_if_absent("rx", &text_secret("value", 0)).unwrap();
        assert!(!s.revoke("rx").unwrap());
    }

    #[test]
    fn peek_budget_then_claim() {
        let (s, _dir) = make_store();
        let new = NewSecret {
            peek_allowed: true,
            view_limit: 3,
            ..text_secret("previewable", 3600)
        };
        s.put_if_absent("pk", &new).unwrap();

        for remaining in [2u32, 1, 0] {
            match s.peek("pk").unwrap() {
                PeekOutcome::Peeked {
                    secret,
                    views_remaining,
                } => {
                    assert_eq!(secret.payload, b"previewable");
                    assert_eq!(views_remaining, remaining);
                }
                other => panic!("expected Peeked, got {other:?}"),
            }
        }

        // Fourth peek is denied, not NotFound.
        assert_eq!(s.peek("pk").unwrap(), PeekOutcome::Denied);

        // Peeking never destroys — the record is still claimable.
        assert!(matches!(
            s.claim("pk").unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[test]
    fn peek_denied_when_not_enabled() {
        let (s, _dir) = make_store();
        s.put_if_absent("np", &text_secret("value", 3600)).unwrap();
        assert_eq!(s.peek("np").unwrap(), PeekOutcome::Denied);
    }

    #[test]
    fn peek_unknown_id_not_found() {
        let (s, _dir) = make_store();
        assert_eq!(s.peek("nope").unwrap(), PeekOutcome::NotFound);
    }

    #[test]
    fn prune_removes_only_expired() {
        let (s, _dir) = make_store();
        s.put_if_absent("live", &text_secret("v", 3600)).unwrap();
        s.put_if_absent("dead", &text_secret("v", 0)).unwrap();

        let removed = s.prune().unwrap();
        assert_eq!(removed, vec!["dead".to_string()]);
        assert!(matches!(s.claim("live").unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn file_metadata_round_trips() {
        let (s, _dir) = make_store();
        let new = NewSecret {
            payload: vec![0xde, 0xad, 0xbe, 0xef],
            kind: SecretKind::File,
            filename: Some("id_rsa".into()),
            mimetype: Some("application/octet-stream".into()),
            ttl_seconds: 3600,
            peek_allowed: false,
            view_limit: 0,
        };
        s.put_if_absent("file1", &new).unwrap();

        match s.claim("file1").unwrap() {
            ClaimOutcome::Claimed(secret) => {
                assert_eq!(secret.kind, SecretKind::File);
                assert_eq!(secret.filename.as_deref(), Some("id_rsa"));
                assert_eq!(secret.mimetype.as_deref(), Some("application/octet-stream"));
                assert_eq!(secret.payload, vec![0xde, 0xad, 0xbe, 0xef]);
            }
            other => panic!("expected Claimed, got {other:?}"),
        }
    }
}
