//! Public key fingerprints.
//!
//! The fingerprint is stamped on the Node so other components can tell when
//! the key on an instance has been rotated. It covers the key alone: the
//! authorized_keys options and comment around it can change freely.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::BootstrapError;

/// Canonical `<type> <base64>` form of an authorized_keys entry.
///
/// Leading options and the trailing comment are dropped. The key is the
/// first pair of fields whose base64 blob decodes and starts with the
/// length-prefixed key type, as every SSH public key blob does.
pub fn canonical_public_key(authorized_key: &str) -> Result<String, BootstrapError> {
    let fields: Vec<&str> = authorized_key.split_whitespace().collect();
    fields
        .windows(2)
        .find(|pair| is_key_blob(pair[0], pair[1]))
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .ok_or_else(|| {
            BootstrapError::Validation(
                "no public key found in authorized_keys entry".to_string(),
            )
        })
}

fn is_key_blob(key_type: &str, encoded: &str) -> bool {
    let Ok(blob) = STANDARD.decode(encoded) else {
        return false;
    };
    let Some((len, rest)) = blob.split_first_chunk::<4>() else {
        return false;
    };
    let len = u32::from_be_bytes(*len) as usize;
    rest.get(..len) == Some(key_type.as_bytes())
}

/// Hex-encoded SHA-256 of the canonical form of a public key.
///
/// Marshalled keys end in a single `\n` that is not hashed; the canonical
/// form is what remains.
pub fn public_key_fingerprint(authorized_key: impl AsRef<str>) -> Result<String, BootstrapError> {
    let canonical = canonical_public_key(authorized_key.as_ref())?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g";
    const OTHER_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICEiIyQlJicoKSorLC0uLzAxMjM0NTY3ODk6Ozw9Pj9A";

    #[test]
    fn test_known_digest() {
        // sha256 of the canonical line
        assert_eq!(
            public_key_fingerprint(KEY).unwrap(),
            "050206921e9de334f31b3d112ca3a8993d3c58da994ad701a6dae47f371ee131"
        );
    }

    #[test]
    fn test_comment_and_newline_do_not_change_fingerprint() {
        let bare = public_key_fingerprint(KEY).unwrap();
        assert_eq!(public_key_fingerprint(format!("{KEY}\n")).unwrap(), bare);
        assert_eq!(
            public_key_fingerprint(format!("{KEY} core@winc\n")).unwrap(),
            bare
        );
        assert_eq!(
            public_key_fingerprint(format!("{KEY} core@winc rotated 2024")).unwrap(),
            bare
        );
    }

    #[test]
    fn test_options_are_ignored() {
        let line = format!(r#"no-pty,command="echo hello world" {KEY} admin"#);
        assert_eq!(canonical_public_key(&line).unwrap(), KEY);
        assert_eq!(
            public_key_fingerprint(line).unwrap(),
            public_key_fingerprint(KEY).unwrap()
        );
    }

    #[test]
    fn test_rsa_key_with_padding() {
        let key = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAABQDB0uP0";
        assert_eq!(canonical_public_key(&format!("{key} core")).unwrap(), key);
    }

    #[test]
    fn test_distinct_keys_differ() {
        assert_ne!(
            public_key_fingerprint(KEY).unwrap(),
            public_key_fingerprint(OTHER_KEY).unwrap()
        );
    }

    #[test]
    fn test_rejects_entries_without_a_key() {
        for line in [
            "",
            "core@winc",
            "ssh-ed25519 not-base64!",
            // blob encodes ssh-ed25519 but the declared type differs
            "ssh-rsa AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g",
        ] {
            let err = public_key_fingerprint(line).unwrap_err();
            assert!(err.is_validation(), "{line:?} should be rejected");
        }
    }
}
