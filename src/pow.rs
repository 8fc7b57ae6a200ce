//! Proof-of-work puzzle used by the race election strategy.
//!
//! A solution is a nonce such that `sha256(challenge ":" claimant ":" nonce)`
//! starts with `difficulty` zero bits. Binding the claimant id into the hash
//! keeps one node's solution from being replayed by another.

use std::time::Instant;

use sha2::{Digest, Sha256};

/// Highest difficulty a node will solve or configure. Each extra bit doubles
/// the expected work.
pub const MAX_DIFFICULTY: u32 = 32;

/// Hashes tried between deadline checks.
const DEADLINE_CHECK_EVERY: u64 = 4096;

/// Fresh random challenge string.
pub fn new_challenge() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn digest(challenge: &str, claimant: &str, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(b":");
    hasher.update(claimant.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

pub fn verify(challenge: &str, claimant: &str, nonce: u64, difficulty: u32) -> bool {
    leading_zero_bits(&digest(challenge, claimant, nonce)) >= difficulty
}

/// Brute-force a nonce, giving up at `deadline`. CPU bound; run it on a
/// blocking thread. Returns None past the deadline or when `difficulty`
/// exceeds [`MAX_DIFFICULTY`].
pub fn solve(challenge: &str, claimant: &str, difficulty: u32, deadline: Instant) -> Option<u64> {
    if difficulty > MAX_DIFFICULTY {
        return None;
    }
    let mut nonce = rand::random::<u64>();
    let mut tried: u64 = 0;
    loop {
        if verify(challenge, claimant, nonce, difficulty) {
            return Some(nonce);
        }
        tried += 1;
        if tried % DEADLINE_CHECK_EVERY == 0 && Instant::now() >= deadline {
            return None;
        }
        nonce = nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0xFF]), 16);
        assert_eq!(leading_zero_bits(&[0x0F]), 4);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
    }

    #[test]
    fn test_solution_verifies_only_for_claimant() {
        let challenge = new_challenge();
        let nonce = solve(&challenge, "node-2", 8, soon()).unwrap();
        assert!(verify(&challenge, "node-2", nonce, 8));
        assert!(verify(&challenge, "node-2", nonce, 0));

        // With 8 bits the chance of an accidental match for another id is 1/256;
        // scanning a handful of ids keeps the assertion deterministic enough.
        let replayed = (0..4).filter(|i| verify(&challenge, &format!("other-{i}"), nonce, 8)).count();
        assert!(replayed < 4);
    }

    #[test]
    fn test_solver_gives_up_at_deadline() {
        // 32 bits takes billions of hashes; an expired deadline stops it early.
        let started = Instant::now();
        assert_eq!(solve("c", "n", MAX_DIFFICULTY, started), None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_excessive_difficulty_is_refused() {
        assert_eq!(solve("c", "n", 200, soon()), None);
    }

    #[test]
    fn test_zero_difficulty_accepts_anything() {
        assert!(verify("c", "n", 42, 0));
    }
}
