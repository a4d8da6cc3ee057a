//! Serializable access scopes.

use super::capability::{ApiKey, Caveat, PathRestriction};
use super::encryption::EncryptionAccess;
use crate::utils::errors::{Result, UplinkError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Everything needed to open a bucket subtree: satellite, capability and
/// encryption access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessScope {
    /// Root capability with unrestricted encryption access.
    Full {
        satellite: String,
        api_key: ApiKey,
        encryption: EncryptionAccess,
    },
    /// Caveat-limited capability with path-limited encryption access.
    Restricted {
        satellite: String,
        api_key: ApiKey,
        encryption: EncryptionAccess,
        caveat: Caveat,
        restriction: PathRestriction,
    },
}

impl AccessScope {
    pub fn satellite(&self) -> &str {
        match self {
            AccessScope::Full { satellite, .. } | AccessScope::Restricted { satellite, .. } => {
                satellite
            }
        }
    }

    pub fn api_key(&self) -> &ApiKey {
        match self {
            AccessScope::Full { api_key, .. } | AccessScope::Restricted { api_key, .. } => api_key,
        }
    }

    pub fn encryption(&self) -> &EncryptionAccess {
        match self {
            AccessScope::Full { encryption, .. } | AccessScope::Restricted { encryption, .. } => {
                encryption
            }
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, AccessScope::Restricted { .. })
    }

    pub fn restriction(&self) -> Option<&PathRestriction> {
        match self {
            AccessScope::Full { .. } => None,
            AccessScope::Restricted { restriction, .. } => Some(restriction),
        }
    }

    /// Encode as an opaque URL-safe token.
    pub fn serialize(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| UplinkError::Format(format!("failed to encode scope: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a token produced by [`AccessScope::serialize`].
    pub fn parse(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| UplinkError::Format(format!("scope is not valid base64: {}", e)))?;
        let scope: AccessScope = serde_json::from_slice(&bytes)
            .map_err(|e| UplinkError::Format(format!("scope is malformed: {}", e)))?;
        scope.check()?;
        Ok(scope)
    }

    fn check(&self) -> Result<()> {
        if self.satellite().is_empty() {
            return Err(UplinkError::Format("scope has no satellite address".into()));
        }
        self.encryption().validate()?;

        match self {
            AccessScope::Full {
                api_key,
                encryption,
                ..
            } => {
                if api_key.is_restricted() || !encryption.is_root() {
                    return Err(UplinkError::Format(
                        "full scope carries a restricted capability".into(),
                    ));
                }
            }
            AccessScope::Restricted {
                api_key,
                encryption,
                caveat,
                restriction,
                ..
            } => {
                if !api_key.is_restricted() || encryption.is_root() {
                    return Err(UplinkError::Format(
                        "restricted scope carries a root capability".into(),
                    ));
                }
                if !encryption.restrictions().contains(restriction)
                    || api_key.caveats().last() != Some(caveat)
                {
                    return Err(UplinkError::Format(
                        "restricted scope does not match its capability".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::encryption::KEY_LEN;

    fn full() -> AccessScope {
        AccessScope::Full {
            satellite: "sat.example.io:7777".into(),
            api_key: ApiKey::issue(b"secret", b"head".to_vec()),
            encryption: EncryptionAccess::from_root_key([3u8; KEY_LEN]),
        }
    }

    #[test]
    fn test_full_scope_survives_token() {
        let scope = full();
        let parsed = AccessScope::parse(&scope.serialize().unwrap()).unwrap();
        assert_eq!(parsed, scope);
        assert!(!parsed.is_restricted());
        assert_eq!(parsed.satellite(), "sat.example.io:7777");
    }

    #[test]
    fn test_restricted_scope_survives_token() {
        let restriction = PathRestriction::new("backups", "2024/");
        let caveat = Caveat {
            disallow_deletes: true,
            allowed_paths: vec![restriction.clone()],
            ..Caveat::default()
        };
        let scope = AccessScope::Restricted {
            satellite: "sat.example.io:7777".into(),
            api_key: full().api_key().restrict(caveat.clone()).unwrap(),
            encryption: full().encryption().restrict(&restriction).unwrap(),
            caveat: caveat.clone(),
            restriction: restriction.clone(),
        };

        let parsed = AccessScope::parse(&scope.serialize().unwrap()).unwrap();
        assert!(parsed.is_restricted());
        assert_eq!(parsed.restriction(), Some(&restriction));
        assert_eq!(parsed.api_key().caveats(), &[caveat]);
        assert_eq!(parsed, scope);
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for token in ["", "%%%", &URL_SAFE_NO_PAD.encode(b"{\"kind\":\"full\"}")] {
            assert!(matches!(AccessScope::parse(token), Err(UplinkError::Format(_))));
        }
    }

    #[test]
    fn test_parse_rejects_mislabelled_full_scope() {
        let restricted_key = full()
            .api_key()
            .restrict(Caveat {
                disallow_reads: true,
                ..Caveat::default()
            })
            .unwrap();
        let forged = AccessScope::Full {
            satellite: "sat".into(),
            api_key: restricted_key,
            encryption: EncryptionAccess::from_root_key([3u8; KEY_LEN]),
        };
        let token = forged.serialize().unwrap();
        assert!(matches!(AccessScope::parse(&token), Err(UplinkError::Format(_))));
    }

    fn restricted(restriction: &PathRestriction) -> (ApiKey, Caveat) {
        let caveat = Caveat {
            allowed_paths: vec![restriction.clone()],
            ..Caveat::default()
        };
        (full().api_key().restrict(caveat.clone()).unwrap(), caveat)
    }

    #[test]
    fn test_parse_rejects_mislabelled_restricted_scope() {
        let restriction = PathRestriction::new("backups", "2024/");
        let (api_key, caveat) = restricted(&restriction);
        let forged = AccessScope::Restricted {
            satellite: "sat".into(),
            api_key,
            encryption: EncryptionAccess::from_root_key([3u8; KEY_LEN]),
            caveat,
            restriction,
        };
        let token = forged.serialize().unwrap();
        assert!(matches!(AccessScope::parse(&token), Err(UplinkError::Format(_))));
    }

    #[test]
    fn test_parse_rejects_restriction_outside_encryption() {
        let restriction = PathRestriction::new("backups", "2024/");
        let wider = PathRestriction::new("backups", "");
        let (api_key, caveat) = restricted(&restriction);

        let forged = AccessScope::Restricted {
            satellite: "sat".into(),
            api_key: api_key.clone(),
            encryption: full().encryption().restrict(&restriction).unwrap(),
            caveat: caveat.clone(),
            restriction: wider.clone(),
        };
        let token = forged.serialize().unwrap();
        assert!(matches!(AccessScope::parse(&token), Err(UplinkError::Format(_))));

        let forged = AccessScope::Restricted {
            satellite: "sat".into(),
            api_key,
            encryption: full().encryption().restrict(&restriction).unwrap(),
            caveat: Caveat {
                allowed_paths: vec![wider],
                ..Caveat::default()
            },
            restriction,
        };
        let token = forged.serialize().unwrap();
        assert!(matches!(AccessScope::parse(&token), Err(UplinkError::Format(_))));
    }
}
