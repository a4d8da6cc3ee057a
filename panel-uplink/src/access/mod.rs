//! Access scope derivation.
//!
//! Turns a root API key and passphrase into a full [`AccessScope`], optionally
//! derives a caveat- and path-restricted scope from it, and decides which scope
//! the upload uses and which token goes back to the caller.

pub mod capability;
pub mod encryption;
pub mod scope;

pub use capability::{Action, ApiKey, Caveat, PathRestriction};
pub use encryption::{EncryptionAccess, KdfParams};
pub use scope::AccessScope;

use crate::config::StorageConfig;
use crate::utils::errors::{Result, UplinkError};
use tracing::{info, warn};

/// How the caller supplies storage credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Use the already-serialized scope from the storage config.
    SerializedScope,
    /// Derive scopes from the raw API key and passphrase.
    RawKey { restrict: bool },
}

/// Outcome of scope resolution.
#[derive(Debug, Clone)]
pub struct ResolvedAccess {
    /// Scope the uploading process itself uses.
    pub upload_scope: AccessScope,
    /// Token handed back to the caller, if one was derived.
    pub token: Option<String>,
    /// Whether `token` is the restricted variant.
    pub restricted_token: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AccessScopeBuilder {
    kdf: KdfParams,
}

impl AccessScopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kdf_params(kdf: KdfParams) -> Self {
        Self { kdf }
    }

    /// Derive encryption access from the passphrase. Deterministic in its inputs.
    pub fn derive_access(
        &self,
        root: &ApiKey,
        passphrase: &str,
        satellite: &str,
    ) -> Result<EncryptionAccess> {
        EncryptionAccess::derive(root, passphrase, satellite, self.kdf)
    }

    pub fn build_full_scope(
        &self,
        satellite: &str,
        root: ApiKey,
        encryption: EncryptionAccess,
    ) -> AccessScope {
        AccessScope::Full {
            satellite: satellite.to_string(),
            api_key: root,
            encryption,
        }
    }

    /// Derive a scope limited by `caveat` and confined to `restriction`.
    pub fn restrict(
        &self,
        scope: &AccessScope,
        caveat: &Caveat,
        restriction: &PathRestriction,
    ) -> Result<AccessScope> {
        if restriction.bucket.is_empty() {
            return Err(UplinkError::Validation(
                "a bucket name is required to restrict an access scope".into(),
            ));
        }

        let mut caveat = caveat.clone();
        caveat.allowed_paths = vec![restriction.clone()];

        Ok(AccessScope::Restricted {
            satellite: scope.satellite().to_string(),
            api_key: scope.api_key().restrict(caveat.clone())?,
            encryption: scope.encryption().restrict(restriction)?,
            caveat,
            restriction: restriction.clone(),
        })
    }

    /// Pick the upload scope and the returned token for `mode`.
    ///
    /// With a raw key the full scope is always derived and always used for the
    /// upload; a restricted token replaces the full one as the returned value
    /// only when `restrict` is set. With a serialized scope the token is parsed
    /// and used as is, and nothing is returned.
    pub fn resolve(&self, storage: &StorageConfig, mode: AccessMode) -> Result<ResolvedAccess> {
        match mode {
            AccessMode::SerializedScope => {
                if storage.serialized_scope.trim().is_empty() {
                    return Err(UplinkError::Validation(
                        "serializedScope is required when no raw API key is used".into(),
                    ));
                }
                let scope = AccessScope::parse(&storage.serialized_scope)?;
                if scope.is_restricted() {
                    warn!("Uploading with a restricted scope; the bucket must already exist");
                }
                Ok(ResolvedAccess {
                    upload_scope: scope,
                    token: None,
                    restricted_token: false,
                })
            }
            AccessMode::RawKey { restrict } => {
                if storage.api_key.trim().is_empty() || storage.satellite.trim().is_empty() {
                    return Err(UplinkError::Validation(
                        "apikey and satelliteURL are required to derive a scope".into(),
                    ));
                }
                let restriction = storage.path_restriction();
                if restrict && restriction.bucket.is_empty() {
                    return Err(UplinkError::Validation(
                        "a bucket name is required to restrict an access scope".into(),
                    ));
                }

                info!("Parsing the API key...");
                let root = ApiKey::parse(&storage.api_key)?;

                info!("Deriving encryption access from passphrase...");
                let encryption = self.derive_access(&root, &storage.passphrase, &storage.satellite)?;
                let full = self.build_full_scope(&storage.satellite, root, encryption);

                let token = if restrict {
                    let restricted = self.restrict(&full, &storage.caveat(), &restriction)?;
                    restricted.serialize()?
                } else {
                    full.serialize()?
                };

                Ok(ResolvedAccess {
                    upload_scope: full,
                    token: Some(token),
                    restricted_token: restrict,
                })
            }
        }
    }
}
