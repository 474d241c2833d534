//! Key-encoding helpers shared by the storage handler and the reconciler.
//!
//! Externally visible keys carry a fixed namespace prefix; when key hashing is
//! enabled the entity id is hashed before prefixing. Tokens are org-scoped:
//! an org-bound token is the 24-character org id followed by the local key id.

use sha2::{Digest, Sha256};

/// Length of an organisation id prefix inside a token.
pub const ORG_ID_LENGTH: usize = 24;

/// Hash a key string. Used whenever key hashing is enabled.
pub fn hash_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash `key` only when `hash_keys` is set, otherwise pass it through.
pub fn hash_key(key: &str, hash_keys: bool) -> String {
    if !hash_keys {
        return key.to_string();
    }
    hash_str(key)
}

/// Build the externally visible form of a key: namespace prefix plus the
/// (optionally hashed) entity id.
pub fn fix_key(prefix: &str, hash_keys: bool, key: &str) -> String {
    format!("{}{}", prefix, hash_key(key, hash_keys))
}

/// Strip the first occurrence of the namespace prefix from a key.
pub fn clean_key(prefix: &str, key: &str) -> String {
    key.replacen(prefix, "", 1)
}

/// Redact a key for logging, keeping only the last four characters.
pub fn obfuscate_key(key: &str) -> String {
    if key.len() > 4 {
        format!("****{}", &key[key.len() - 4..])
    } else {
        "--".to_string()
    }
}

/// The org id prefix of a token, or an empty string for custom keys and
/// usernames that carry none.
pub fn token_org(token: &str) -> &str {
    if token.len() > ORG_ID_LENGTH {
        &token[..ORG_ID_LENGTH]
    } else {
        ""
    }
}

/// The local id portion of an org-bound token, if the token has one.
pub fn token_id(token: &str) -> Option<&str> {
    if token.len() > ORG_ID_LENGTH {
        Some(&token[ORG_ID_LENGTH..])
    } else {
        None
    }
}

/// Canonicalize a key id into an org-bound token. Custom keys and usernames
/// are prefixed with the org id; an empty id gets a fresh random one.
pub fn generate_token(org_id: &str, key_id: &str) -> String {
    let key_id = key_id.strip_prefix(org_id).unwrap_or(key_id);
    if key_id.is_empty() {
        return format!("{}{}", org_id, uuid::Uuid::new_v4().simple());
    }
    format!("{}{}", org_id, key_id)
}
