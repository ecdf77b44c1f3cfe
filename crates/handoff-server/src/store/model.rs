use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// What a secret's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    Text,
    File,
}

/// Stored in redb as bincode-encoded bytes.
/// `payload_encrypted` is ChaCha20Poly1305 ciphertext over the raw payload.
/// All metadata is plaintext so the background sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// ChaCha20Poly1305 ciphertext (payload + tag).
    pub payload_encrypted: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub nonce: [u8; 12],
    #[zeroize(skip)]
    pub kind: SecretKind,
    /// Original filename, file-kind secrets only.
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) after which the record is gone, fixed at creation.
    pub expires_at: i64,
    /// Whether non-destructive previews were enabled at creation.
    pub peek_allowed: bool,
    /// Maximum number of peeks before further previews are denied.
    pub view_limit: u32,
    /// How many times this record has been peeked. Only ever incremented.
    pub view_count: u32,
}

impl SecretRecord {
    /// Wall-clock expiry check, applied on every read even when the
    /// background sweep has not evicted the record yet.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn peeks_exhausted(&self) -> bool {
        self.view_count >= self.view_limit
    }
}

/// Decrypted payload and metadata handed back to callers. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub payload: Vec<u8>,
    pub kind: SecretKind,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    pub expires_at: i64,
}

/// Parameters for a new record. The store encrypts the payload and stamps
/// `created_at` / `expires_at` itself.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub payload: Vec<u8>,
    pub kind: SecretKind,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    pub ttl_seconds: u64,
    pub peek_allowed: bool,
    pub view_limit: u32,
}

/// Result of an insert attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Inserted; the record expires at the given unix timestamp.
    Stored { expires_at: i64 },
    /// The identifier is occupied by a live record. Caller retries with a
    /// freshly generated identifier.
    Collision,
}

/// Result of a destructive claim.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Found, decrypted, and removed. No later claim can succeed.
    Claimed(Secret),
    /// Unknown, TTL-expired, revoked, or already claimed.
    NotFound,
}

/// Result of a non-destructive peek.
#[derive(Debug, PartialEq, Eq)]
pub enum PeekOutcome {
    /// Found; the view counter was incremented as part of the read.
    Peeked { secret: Secret, views_remaining: u32 },
    /// Unknown, TTL-expired, revoked, or already claimed.
    NotFound,
    /// The record exists but peeking is disabled or the view budget is spent.
    /// Distinct from `NotFound` — the record remains claimable.
    Denied,
}
