//! Chained step cache keys.
//!
//! The key of step `n` hashes the key of step `n - 1`, the canonical text of
//! the directive and whatever content the directive reads. Changing any step
//! therefore changes the key of every step after it.

use sha2::{Digest, Sha256};

use crate::reference::ImageReference;

/// Bumped when the layer format or key derivation changes.
pub const KEY_VERSION: &str = "image-builder/v1";

/// Key of the `FROM` step.
pub fn base_key(reference: &ImageReference, base_digest: &str, config_digest: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    field(&mut hasher, KEY_VERSION);
    field(&mut hasher, "FROM");
    field(&mut hasher, &reference.to_string());
    field(&mut hasher, base_digest);
    field(&mut hasher, config_digest.unwrap_or(""));
    format!("{:x}", hasher.finalize())
}

/// Key of a later step.
pub fn step_key(previous: &str, directive: &str, inputs: &str) -> String {
    let mut hasher = Sha256::new();
    field(&mut hasher, previous);
    field(&mut hasher, directive);
    field(&mut hasher, inputs);
    format!("{:x}", hasher.finalize())
}

// Length prefix so that ("ab", "c") and ("a", "bc") never collide.
fn field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_chain_through_previous() {
        let reference: ImageReference = "python:3.11-slim".parse().unwrap();
        let k0 = base_key(&reference, "sha256:aa", None);
        let k1 = step_key(&k0, "WORKDIR /app", "");
        assert_eq!(k1, step_key(&k0, "WORKDIR /app", ""));
        assert_eq!(k1.len(), 64);

        let other_base = base_key(&reference, "sha256:bb", None);
        assert_ne!(k1, step_key(&other_base, "WORKDIR /app", ""));
        assert_ne!(k0, base_key(&reference, "sha256:aa", Some("sha256:cc")));
    }

    #[test]
    fn fields_are_delimited() {
        assert_ne!(step_key("k", "ab", "c"), step_key("k", "a", "bc"));
    }
}
