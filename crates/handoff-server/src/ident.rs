use rand::{rngs::OsRng, Rng};

/// Lowercase alphanumeric, 36 symbols. Six symbols give a bit over 31 bits
/// of entropy; callers wanting more choose a longer identifier.
pub const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub const MIN_LENGTH: usize = 6;
pub const MAX_LENGTH: usize = 12;

/// Generate a random identifier of `len` symbols (clamped to 6..=12).
///
/// Identifiers double as bearer capabilities, so symbols are drawn from the
/// OS CSPRNG — never a seeded or thread-local PRNG. `gen_range` keeps the
/// selection unbiased. Uniqueness is not checked here; the store's
/// put-if-absent enforces it.
pub fn generate(len: usize) -> String {
    let len = len.clamp(MIN_LENGTH, MAX_LENGTH);
    let mut rng = OsRng;
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_requested_length() {
        assert_eq!(generate(6).len(), 6);
        assert_eq!(generate(12).len(), 12);
    }

    #[test]
    fn clamps_out_of_range_lengths() {
        assert_eq!(generate(0).len(), MIN_LENGTH);
        assert_eq!(generate(100).len(), MAX_LENGTH);
    }

    #[test]
    fn stays_in_alphabet() {
        let id = generate(12);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn successive_identifiers_differ() {
        // At 62 bits of entropy a repeat here means the generator is broken.
        let a = generate(12);
        let b = generate(12);
        assert_ne!(a, b);
    }
}
