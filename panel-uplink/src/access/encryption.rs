//! Passphrase-derived encryption access.
//!
//! The root key comes from Argon2id over the passphrase, salted with the
//! satellite address and the API key head, so the same inputs always yield the
//! same key. Object keys are derived hierarchically: each `/`-separated
//! component of `bucket/object/key` is folded in with HMAC-SHA256. Narrowing
//! an access to a bucket/prefix keeps only the key of that node, from which
//! nothing outside the subtree can be derived.

use super::capability::{base64_bytes, split_components, ApiKey, PathRestriction};
use crate::utils::errors::{Result, StorageError, UplinkError};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Length of every key handled here.
pub const KEY_LEN: usize = 32;

pub type Key = [u8; KEY_LEN];

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP baseline for Argon2id
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScopedKey {
    bucket: String,
    #[serde(default)]
    prefix: String,
    #[serde(with = "base64_bytes")]
    key: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionAccess {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_key")]
    root: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scoped: Vec<ScopedKey>,
}

impl EncryptionAccess {
    /// Derive the root access for `api_key` on `satellite` from `passphrase`.
    pub fn derive(
        api_key: &ApiKey,
        passphrase: &str,
        satellite: &str,
        params: KdfParams,
    ) -> Result<Self> {
        let salt = derivation_salt(api_key, satellite);
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| UplinkError::Validation(format!("invalid key derivation parameters: {}", e)))?;

        let mut key = [0u8; KEY_LEN];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| UplinkError::Validation(format!("key derivation failed: {}", e)))?;

        Ok(Self::from_root_key(key))
    }

    /// Access holding an unrestricted root key.
    pub fn from_root_key(key: Key) -> Self {
        Self {
            root: Some(key.to_vec()),
            scoped: Vec::new(),
        }
    }

    /// True when the access can derive keys for any bucket.
    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    /// The bucket/prefix subtrees a narrowed access covers.
    pub fn restrictions(&self) -> Vec<PathRestriction> {
        self.scoped
            .iter()
            .map(|s| PathRestriction::new(&s.bucket, &s.prefix))
            .collect()
    }

    /// Narrow to the subtree rooted at `restriction`.
    pub fn restrict(&self, restriction: &PathRestriction) -> Result<Self> {
        let key = self.node_key(&restriction.bucket, &restriction.prefix_components())?;
        Ok(Self {
            root: None,
            scoped: vec![ScopedKey {
                bucket: restriction.bucket.clone(),
                prefix: restriction.path_prefix.clone(),
                key: key.to_vec(),
            }],
        })
    }

    /// Content key of `object_key` in `bucket`.
    pub fn object_key(&self, bucket: &str, object_key: &str) -> Result<Key> {
        self.node_key(bucket, &split_components(object_key))
    }

    fn node_key(&self, bucket: &str, components: &[&str]) -> Result<Key> {
        if let Some(root) = &self.root {
            let start = walk(to_key(root)?, &[bucket])?;
            return walk(start, components);
        }

        // Longest covering prefix wins.
        let covering = self
            .scoped
            .iter()
            .filter_map(|scoped| {
                let prefix = split_components(&scoped.prefix);
                (scoped.bucket == bucket && components.starts_with(&prefix))
                    .then_some((scoped, prefix.len()))
            })
            .max_by_key(|(_, depth)| *depth);

        match covering {
            Some((scoped, depth)) => walk(to_key(&scoped.key)?, &components[depth..]),
            None => Err(StorageError::PermissionDenied(format!(
                "encryption access does not cover {}/{}",
                bucket,
                components.join("/")
            ))
            .into()),
        }
    }

    /// Reject key material of the wrong size.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(root) = &self.root {
            to_key(root)?;
        }
        for scoped in &self.scoped {
            to_key(&scoped.key)?;
        }
        if self.root.is_none() && self.scoped.is_empty() {
            return Err(UplinkError::Format("encryption access holds no keys".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptionAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionAccess")
            .field("root", &self.root.as_ref().map(|_| "<redacted>"))
            .field("restrictions", &self.restrictions())
            .finish()
    }
}

fn derivation_salt(api_key: &ApiKey, satellite: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(satellite.as_bytes());
    hasher.update([0u8]);
    hasher.update(api_key.head());
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&hasher.finalize());
    salt
}

fn walk(mut key: Key, components: &[&str]) -> Result<Key> {
    for component in components {
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| UplinkError::Format(format!("invalid derivation key: {}", e)))?;
        mac.update(component.as_bytes());
        key.copy_from_slice(&mac.finalize().into_bytes());
    }
    Ok(key)
}

fn to_key(bytes: &[u8]) -> Result<Key> {
    bytes
        .try_into()
        .map_err(|_| UplinkError::Format(format!("encryption key must be {} bytes", KEY_LEN)))
}

mod optional_key {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(bytes) => serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => URL_SAFE_NO_PAD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Cheap parameters so tests don't spend seconds in Argon2.
    pub(crate) const TEST_KDF: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    fn api_key() -> ApiKey {
        ApiKey::issue(b"secret", b"project-head".to_vec())
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = EncryptionAccess::derive(&api_key(), "passphrase", "sat:7777", TEST_KDF).unwrap();
        let b = EncryptionAccess::derive(&api_key(), "passphrase", "sat:7777", TEST_KDF).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.object_key("backups", "2024/site.tar.gz").unwrap(),
            b.object_key("backups", "2024/site.tar.gz").unwrap()
        );
    }

    #[test]
    fn test_derivation_depends_on_every_input() {
        let base = EncryptionAccess::derive(&api_key(), "passphrase", "sat:7777", TEST_KDF).unwrap();
        let other_pass = EncryptionAccess::derive(&api_key(), "other", "sat:7777", TEST_KDF).unwrap();
        let other_sat = EncryptionAccess::derive(&api_key(), "passphrase", "sat:7778", TEST_KDF).unwrap();
        let other_key = ApiKey::issue(b"secret", b"another-head".to_vec());
        let other_head = EncryptionAccess::derive(&other_key, "passphrase", "sat:7777", TEST_KDF).unwrap();

        assert_ne!(base, other_pass);
        assert_ne!(base, other_sat);
        assert_ne!(base, other_head);
    }

    #[test]
    fn test_object_keys_differ_per_path() {
        let access = EncryptionAccess::from_root_key([7u8; KEY_LEN]);
        let a = access.object_key("backups", "2024/a.tar.gz").unwrap();
        let b = access.object_key("backups", "2024/b.tar.gz").unwrap();
        let c = access.object_key("other", "2024/a.tar.gz").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_restricted_access_derives_same_keys_inside_prefix() {
        let root = EncryptionAccess::from_root_key([7u8; KEY_LEN]);
        let restricted = root
            .restrict(&PathRestriction::new("backups", "2024/"))
            .unwrap();

        assert!(!restricted.is_root());
        assert_eq!(
            restricted.object_key("backups", "2024/site.tar.gz").unwrap(),
            root.object_key("backups", "2024/site.tar.gz").unwrap()
        );
    }

    #[test]
    fn test_restricted_access_cannot_leave_prefix() {
        let restricted = EncryptionAccess::from_root_key([7u8; KEY_LEN])
            .restrict(&PathRestriction::new("backups", "2024/"))
            .unwrap();

        for (bucket, key) in [("backups", "2023/site.tar.gz"), ("other", "2024/site.tar.gz")] {
            let err = restricted.object_key(bucket, key).unwrap_err();
            assert!(matches!(
                err,
                UplinkError::Storage(StorageError::PermissionDenied(_))
            ));
        }
    }

    #[test]
    fn test_serde_keeps_restrictions() {
        let restricted = EncryptionAccess::from_root_key([1u8; KEY_LEN])
            .restrict(&PathRestriction::new("backups", "2024/"))
            .unwrap();
        let json = serde_json::to_string(&restricted).unwrap();
        let parsed: EncryptionAccess = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed, restricted);
        assert_eq!(parsed.restrictions(), vec![PathRestriction::new("backups", "2024/")]);
    }

    #[test]
    fn test_validate_rejects_short_keys() {
        let parsed: EncryptionAccess = serde_json::from_str(r#"{"root": "AAAA"}"#).unwrap();
        assert!(matches!(parsed.validate(), Err(UplinkError::Format(_))));

        let empty: EncryptionAccess = serde_json::from_str("{}").unwrap();
        assert!(matches!(empty.validate(), Err(UplinkError::Format(_))));
    }
}
