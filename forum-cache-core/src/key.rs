//! Epoch-scoped cache keys and per-instance key namespacing.
//!
//! A `ScopedKey` cannot be built without an epoch, so every key that reaches
//! a backend is tied to the invalidation generation that was current when the
//! caller asked. Advancing the epoch therefore makes every older entry
//! unreachable without touching storage.

use sha2::{Digest, Sha256};

/// Marker appended to every derived instance prefix.
const PREFIX_MARKER: &str = "-SBB-";

/// Number of hex characters of the board URL digest kept in a derived prefix.
const PREFIX_DIGEST_LEN: usize = 12;

/// A logical cache key bound to an invalidation epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    inner: ScopedKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedKeyInner {
    epoch: u64,
    key: String,
}

impl ScopedKey {
    /// Bind `key` to `epoch`.
    pub fn new(epoch: u64, key: impl Into<String>) -> Self {
        Self {
            inner: ScopedKeyInner {
                epoch,
                key: key.into(),
            },
        }
    }

    /// The epoch this key was scoped to.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    /// The caller-supplied logical key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }
}

/// Per-forum-instance key namespace.
///
/// Transforms a [`ScopedKey`] into the string a backend actually stores:
/// `{prefix}{epoch}-{key}{suffix}` where `:` becomes `-` and `/` becomes `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Use an explicit prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Derive a stable prefix from the board URL, so that two forums sharing
    /// one backend never see each other's keys.
    pub fn for_instance(board_url: &str) -> Self {
        let digest = Sha256::digest(board_url.as_bytes());
        let mut prefix = hex::encode(digest);
        prefix.truncate(PREFIX_DIGEST_LEN);
        prefix.push_str(PREFIX_MARKER);
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key without a suffix token.
    pub fn storage_key(&self, key: &ScopedKey) -> String {
        self.storage_key_with_suffix(key, "")
    }

    /// Storage key with a backend-specific suffix token appended.
    pub fn storage_key_with_suffix(&self, key: &ScopedKey, suffix: &str) -> String {
        let logical = key.key();
        let mut out = String::with_capacity(
            self.prefix.len() + logical.len() + suffix.len() + 21,
        );
        out.push_str(&self.prefix);
        out.push_str(&key.epoch().to_string());
        out.push('-');
        out.extend(logical.chars().map(|c| match c {
            ':' => '-',
            '/' => '_',
            other => other,
        }));
        out.push_str(suffix);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_storage_key_substitutes_reserved_characters() {
        let ns = KeyNamespace::new("abc-SBB-");
        let key = ScopedKey::new(3, "board:7/topics");
        assert_eq!(ns.storage_key(&key), "abc-SBB-3-board-7_topics");
    }

    #[test]
    fn test_storage_key_with_suffix() {
        let ns = KeyNamespace::new("p-");
        let key = ScopedKey::new(0, "menu_buttons");
        assert_eq!(ns.storage_key_with_suffix(&key, "sbb"), "p-0-menu_buttonssbb");
    }

    #[test]
    fn test_for_instance_is_stable_and_distinct() {
        let a = KeyNamespace::for_instance("https://forum.example.org");
        let b = KeyNamespace::for_instance("https://forum.example.org");
        let c = KeyNamespace::for_instance("https://other.example.org");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.prefix().len(), PREFIX_DIGEST_LEN + PREFIX_MARKER.len());
        assert!(a.prefix().ends_with(PREFIX_MARKER));
    }

    #[test]
    fn test_epoch_changes_storage_key() {
        let ns = KeyNamespace::new("x-");
        let old = ns.storage_key(&ScopedKey::new(1, "board_list_3"));
        let new = ns.storage_key(&ScopedKey::new(2, "board_list_3"));
        assert_ne!(old, new);
    }

    proptest! {
        #[test]
        fn prop_storage_key_has_no_reserved_characters(key in ".*", epoch in any::<u64>()) {
            let ns = KeyNamespace::new("ns-");
            let stored = ns.storage_key(&ScopedKey::new(epoch, key));
            prop_assert!(!stored.contains(':'));
            prop_assert!(!stored.contains('/'));
            prop_assert!(stored.starts_with("ns-"));
        }

        #[test]
        fn prop_distinct_epochs_never_collide(key in "[a-z_]{1,16}", a in any::<u64>(), b in any::<u64>()) {
            prop_assume!(a != b);
            let ns = KeyNamespace::new("ns-");
            prop_assert_ne!(
                ns.storage_key(&ScopedKey::new(a, key.clone())),
                ns.storage_key(&ScopedKey::new(b, key))
            );
        }
    }
}
