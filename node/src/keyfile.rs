//! # Key Files
//!
//! A party's identity is a raw 64-byte Ed25519 keypair file — the secret
//! half followed by the public half, no encoding, read once at startup.
//! Anything that can't be read as exactly 64 bytes is a configuration
//! error and fatal.

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use std::path::Path;

use tessera_protocol::config::KEYPAIR_FILE_LENGTH;

/// Generates a fresh keypair and writes it to `path` (mode 0600 on Unix).
pub fn generate(path: &Path, force: bool) -> Result<SigningKey> {
    if path.exists() && !force {
        bail!(
            "key file {} already exists (use --force to overwrite)",
            path.display()
        );
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    std::fs::write(path, key.to_keypair_bytes())
        .with_context(|| format!("writing key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {}", path.display()))?;
    }
    Ok(key)
}

/// Reads a keypair file written by [`generate`].
pub fn load(path: &Path) -> Result<SigningKey> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading key file {}", path.display()))?;
    if bytes.len() != KEYPAIR_FILE_LENGTH {
        bail!(
            "key file {} holds {} bytes, want {}",
            path.display(),
            bytes.len(),
            KEYPAIR_FILE_LENGTH
        );
    }
    let raw: [u8; KEYPAIR_FILE_LENGTH] = bytes.try_into().expect("length checked above");
    SigningKey::from_keypair_bytes(&raw)
        .with_context(|| format!("key file {} is not a valid Ed25519 keypair", path.display()))
}
