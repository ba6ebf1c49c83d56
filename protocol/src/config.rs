//! # Protocol Constants
//!
//! Every magic number in Tessera lives here. The chunking geometry and the
//! hash lengths are consensus-critical: both parties and the ledger's
//! verifier recompute the same hashes over the same byte layouts, so a
//! mismatch here is not a bug you debug — it is a different protocol.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Chunking Geometry
// ---------------------------------------------------------------------------

/// Plaintext chunk length in bytes. Power of two, and the record capacity of
/// the cipher-chunk stores. The final chunk of a file may be shorter; every
/// other chunk is exactly this long.
pub const CHUNK_SIZE: usize = 8192;

/// Output length of SHA-256, used for chunk hashes, Merkle nodes, anchors,
/// asset ids, and transfer keys alike.
pub const HASH_LENGTH: usize = 32;

/// Maximum encoded length of an unsigned LEB128 varint for a u64.
pub const MAX_UVARINT_LENGTH: usize = 10;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Symmetric transfer key length. The keystream for chunk `i` is derived
/// from `(key, i)` block by block, so the key alone fixes the entire
/// ciphertext for a given plaintext.
pub const KEY_LENGTH: usize = 32;

/// Ed25519 public key length.
pub const PUBKEY_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of an on-disk key file: raw Ed25519 keypair bytes, secret half
/// followed by the public half.
pub const KEYPAIR_FILE_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// HTTP response header carrying the seller-assigned transfer identifier.
pub const TRANSFER_ID_HEADER: &str = "X-Tedd-Transfer-Id";

/// Default bind address for the seller's HTTP server.
pub const DEFAULT_SERVE_ADDR: &str = "0.0.0.0:9630";

// ---------------------------------------------------------------------------
// Ledger Interaction
// ---------------------------------------------------------------------------

/// How often the observer asks the ledger for new blocks.
pub const LEDGER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Number of submission attempts before a rejection is treated as fatal.
pub const SUBMIT_RETRIES: u32 = 5;

/// Backoff added between submission attempts. Linear, not exponential: the
/// useful window is bounded by the refund deadline, and a handful of evenly
/// spaced retries covers it better than one long sleep at the end.
pub const SUBMIT_BACKOFF: Duration = Duration::from_millis(750);

/// Safety margin before the refund deadline at which refund submission
/// retries give up and surface the error instead.
pub const REFUND_SUBMIT_MARGIN_MS: u64 = 2_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_power_of_two() {
        assert!(CHUNK_SIZE.is_power_of_two());
    }

    #[test]
    fn key_and_hash_lengths_agree() {
        // Keys, roots, and anchors all travel through 32-byte slots in the
        // contract; the codec assumes they are interchangeable lengths.
        assert_eq!(KEY_LENGTH, HASH_LENGTH);
        assert_eq!(PUBKEY_LENGTH, HASH_LENGTH);
    }

    #[test]
    fn keypair_file_holds_both_halves() {
        assert_eq!(KEYPAIR_FILE_LENGTH, 2 * PUBKEY_LENGTH);
    }

    #[test]
    fn retry_window_is_sane() {
        let worst_case = SUBMIT_BACKOFF.as_millis() as u64 * SUBMIT_RETRIES as u64;
        assert!(worst_case > REFUND_SUBMIT_MARGIN_MS);
    }
}
