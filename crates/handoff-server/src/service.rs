use anyhow::Result;
use tracing::warn;

use crate::ident;
use crate::ratelimit::{OpClass, RateLimiter};
use crate::store::{
    ClaimOutcome, NewSecret, PeekOutcome, PutOutcome, Secret, SecretKind, Store,
};

/// Allowed TTL labels and their durations in seconds.
pub const TTL_LABELS: &[(&str, u64)] = &[
    ("1h", 3_600),
    ("6h", 21_600),
    ("12h", 43_200),
    ("1d", 86_400),
    ("7d", 604_800),
];

/// Resolve a TTL label to seconds. `None` for anything outside the allowed set.
pub fn resolve_ttl(label: &str) -> Option<u64> {
    TTL_LABELS
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, secs)| *secs)
}

/// Requests with no attributable network address share one bucket. Easier for
/// unrelated clients to exhaust, deliberately — better than unthrottled.
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone)]
pub struct ExchangePolicy {
    /// Hard cap on payload bytes. Exactly this size is accepted.
    pub max_payload_bytes: usize,
    /// Identifier length in symbols, clamped by the generator to 6..=12.
    pub id_length: usize,
    /// How many fresh identifiers to try when put-if-absent reports collisions.
    pub max_id_attempts: u32,
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self {
            max_payload_bytes: 5 * 1024 * 1024,
            id_length: 6,
            max_id_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub payload: Vec<u8>,
    pub kind: SecretKind,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    /// One of `TTL_LABELS`.
    pub ttl: String,
    pub peek_allowed: bool,
    pub view_limit: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreResult {
    Stored { id: String, expires_at: i64 },
    /// Payload exceeds the policy cap. Nothing was written.
    PayloadTooLarge { size: usize, max: usize },
    /// TTL label outside the allowed set. Nothing was written.
    InvalidTtl(String),
    Throttled,
    /// Every generated identifier collided. At the configured entropy this
    /// means something is badly wrong, not that the caller should retry.
    IdsExhausted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed(Secret),
    NotFound,
    Throttled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeekResult {
    Peeked { secret: Secret, views_remaining: u32 },
    NotFound,
    /// View budget spent or peeking never enabled — distinct from `NotFound`
    /// so a client can say "maximum previews reached" instead of "gone".
    Denied,
    Throttled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RevokeResult {
    Revoked,
    NotFound,
}

/// Orchestrates the identifier generator, secret store, and rate limiter.
/// Stateless beyond its injected collaborators, so any number of instances
/// may run against the same database.
///
/// All methods return `Err` only for backend failure; every domain outcome is
/// an enum variant. Callers must keep those apart — "secret is gone" is never
/// "we couldn't check".
#[derive(Clone)]
pub struct ExchangeService {
    store: Store,
    limiter: RateLimiter,
    policy: ExchangePolicy,
}

impl ExchangeService {
    pub fn new(store: Store, limiter: RateLimiter, policy: ExchangePolicy) -> Self {
        Self {
            store,
            limiter,
            policy,
        }
    }

    fn client<'a>(&self, client: &'a str) -> &'a str {
        if client.is_empty() {
            UNKNOWN_CLIENT
        } else {
            client
        }
    }

    /// Validate, admit, then insert under a fresh identifier with bounded
    /// retries on collision. Validation failures never touch storage and do
    /// not consume rate budget.
    pub fn store(&self, client: &str, req: StoreRequest) -> Result<StoreResult> {
        if req.payload.len() > self.policy.max_payload_bytes {
            return Ok(StoreResult::PayloadTooLarge {
                size: req.payload.len(),
                max: self.policy.max_payload_bytes,
            });
        }
        let Some(ttl_seconds) = resolve_ttl(&req.ttl) else {
            return Ok(StoreResult::InvalidTtl(req.ttl));
        };

        if !self.limiter.allow(self.client(client), OpClass::Store)? {
            return Ok(StoreResult::Throttled);
        }

        let new = NewSecret {
            payload: req.payload,
            kind: req.kind,
            filename: req.filename,
            mimetype: req.mimetype,
            ttl_seconds,
            peek_allowed: req.peek_allowed,
            view_limit: if req.peek_allowed { req.view_limit } else { 0 },
        };

        for attempt in 1..=self.policy.max_id_attempts {
            let id = ident::generate(self.policy.id_length);
            match self.store.put_if_absent(&id, &new)? {
                PutOutcome::Stored { expires_at } => {
                    return Ok(StoreResult::Stored { id, expires_at });
                }
                PutOutcome::Collision => {
                    warn!(attempt, "identifier collision, regenerating");
                }
            }
        }

        warn!(
            attempts = self.policy.max_id_attempts,
            "identifier generation exhausted"
        );
        Ok(StoreResult::IdsExhausted)
    }

    /// The single destructive retrieval. At most one call ever succeeds per
    /// identifier; the store's atomic read-and-remove decides the winner.
    pub fn claim(&self, client: &str, id: &str) -> Result<ClaimResult> {
        if !self.limiter.allow(self.client(client), OpClass::Claim)? {
            return Ok(ClaimResult::Throttled);
        }
        Ok(match self.store.claim(id)? {
            ClaimOutcome::Claimed(secret) => ClaimResult::Claimed(secret),
            ClaimOutcome::NotFound => ClaimResult::NotFound,
        })
    }

    /// Bounded non-destructive preview.
    pub fn peek(&self, client: &str, id: &str) -> Result<PeekResult> {
        if !self.limiter.allow(self.client(client), OpClass::Peek)? {
            return Ok(PeekResult::Throttled);
        }
        Ok(match self.store.peek(id)? {
            PeekOutcome::Peeked {
                secret,
                views_remaining,
            } => PeekResult::Peeked {
                secret,
                views_remaining,
            },
            PeekOutcome::NotFound => PeekResult::NotFound,
            PeekOutcome::Denied => PeekResult::Denied,
        })
    }

    /// Sender-initiated early destruction. Caller authorization is enforced
    /// at the HTTP layer, not here.
    pub fn revoke(&self, id: &str) -> Result<RevokeResult> {
        Ok(if self.store.revoke(id)? {
            RevokeResult::Revoked
        } else {
            RevokeResult::NotFound
        })
    }
}
