//! API keys as restrictable capabilities.
//!
//! A key is an HMAC-SHA256 chain: the issuer computes
//! `tail = HMAC(secret, head)`, and every restriction appends a caveat and
//! replaces the tail with `HMAC(tail, caveat)`. Any holder can narrow a key
//! without knowing the issuing secret; only the issuer can verify it.

use crate::utils::errors::{Result, UplinkError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Operations a capability may be asked to authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Delete,
    List,
}

/// A bucket, optionally narrowed to a key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRestriction {
    pub bucket: String,
    #[serde(default)]
    pub path_prefix: String,
}

impl PathRestriction {
    pub fn new(bucket: &str, path_prefix: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            path_prefix: path_prefix.to_string(),
        }
    }

    /// Prefix components, ignoring empty segments.
    pub fn prefix_components(&self) -> Vec<&str> {
        split_components(&self.path_prefix)
    }

    /// Whether `key` inside `bucket` lies in this subtree. `None` asks about
    /// the bucket itself.
    pub fn covers(&self, bucket: &str, key: Option<&str>) -> bool {
        if self.bucket != bucket {
            return false;
        }
        match key {
            None => true,
            Some(key) => split_components(key).starts_with(&self.prefix_components()),
        }
    }
}

pub(crate) fn split_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A restriction attached to an API key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    #[serde(default, skip_serializing_if = "is_false")]
    pub disallow_reads: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disallow_writes: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disallow_deletes: bool,

    /// Empty means every path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<PathRestriction>,
}

impl Caveat {
    fn permits(&self, action: Action, bucket: &str, key: Option<&str>) -> bool {
        let operation_allowed = match action {
            Action::Read => !self.disallow_reads,
            Action::Write => !self.disallow_writes,
            Action::Delete => !self.disallow_deletes,
            Action::List => true,
        };
        operation_allowed
            && (self.allowed_paths.is_empty()
                || self.allowed_paths.iter().any(|p| p.covers(bucket, key)))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(with = "base64_bytes")]
    head: Vec<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    caveats: Vec<Caveat>,

    #[serde(with = "base64_bytes")]
    tail: Vec<u8>,
}

impl ApiKey {
    /// Mint a root key. Only the party holding `secret` can do this.
    pub fn issue(secret: &[u8], head: Vec<u8>) -> Self {
        let tail = sign(secret, &head);
        Self {
            head,
            caveats: Vec::new(),
            tail,
        }
    }

    /// Parse the serialized form produced by [`ApiKey::serialize`].
    pub fn parse(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| UplinkError::Format(format!("API key is not valid base64: {}", e)))?;
        let key: ApiKey = serde_json::from_slice(&bytes)
            .map_err(|e| UplinkError::Format(format!("API key is malformed: {}", e)))?;
        if key.head.is_empty() || key.tail.len() != 32 {
            return Err(UplinkError::Format("API key is malformed: bad head or tail".into()));
        }
        Ok(key)
    }

    pub fn serialize(&self) -> String {
        // A struct of strings and bools always encodes.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn is_restricted(&self) -> bool {
        !self.caveats.is_empty()
    }

    /// Derive a narrower key carrying `caveat` in addition to the existing ones.
    pub fn restrict(&self, caveat: Caveat) -> Result<Self> {
        let encoded = serde_json::to_vec(&caveat)
            .map_err(|e| UplinkError::Format(format!("failed to encode caveat: {}", e)))?;
        let mut caveats = self.caveats.clone();
        caveats.push(caveat);
        Ok(Self {
            head: self.head.clone(),
            caveats,
            tail: sign(&self.tail, &encoded),
        })
    }

    /// Recompute the chain from `secret` and compare in constant time.
    pub fn verify(&self, secret: &[u8]) -> bool {
        let mut key = secret.to_vec();
        let mut message = self.head.clone();
        for caveat in &self.caveats {
            key = sign(&key, &message);
            message = match serde_json::to_vec(caveat) {
                Ok(encoded) => encoded,
                Err(_) => return false,
            };
        }
        let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
            return false;
        };
        mac.update(&message);
        mac.verify_slice(&self.tail).is_ok()
    }

    /// Every caveat on the chain must permit the operation.
    pub fn allows(&self, action: Action, bucket: &str, key: Option<&str>) -> bool {
        self.caveats.iter().all(|c| c.permits(action, bucket, key))
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("head", &URL_SAFE_NO_PAD.encode(&self.head))
            .field("caveats", &self.caveats)
            .field("tail", &"<redacted>")
            .finish()
    }
}

fn sign(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
