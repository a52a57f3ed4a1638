use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::ValidationError,
    store::Store,
    types::{Identity, IdentityPatch, GUEST_PREFIX},
};

const LEGACY_CLIENT_PREFIX: &str = "user_";

fn is_valid_token(token: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok())
        .as_ref()
        .map(|re| re.is_match(token))
        .unwrap_or(false)
}

/// Maps a client-held token to its canonical guest id.
///
/// `user_abc` and `abc` both become `guest_abc`; an id that is already
/// canonical passes through.
pub fn guest_id_for_token(token: &str) -> Result<String, ValidationError> {
    let token = token.trim();
    if let Some(rest) = token.strip_prefix(GUEST_PREFIX) {
        return guest_id_for_token(rest);
    }
    let token = token.strip_prefix(LEGACY_CLIENT_PREFIX).unwrap_or(token);
    if !is_valid_token(token) {
        return Err(ValidationError::InvalidToken);
    }
    Ok(format!("{GUEST_PREFIX}{token}"))
}

pub fn random_guest_token() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sentinel_names: Vec<String>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, sentinel_names: Vec<String>) -> Self {
        Self {
            store,
            clock,
            sentinel_names,
        }
    }

    /// Placeholder names like "Guest" that must never replace a learned name.
    pub fn is_sentinel(&self, name: &str) -> bool {
        let name = name.trim();
        name.is_empty()
            || self
                .sentinel_names
                .iter()
                .any(|s| s.trim().to_lowercase() == name.to_lowercase())
    }

    fn default_sentinel(&self) -> String {
        self.sentinel_names
            .first()
            .cloned()
            .unwrap_or_else(|| "Guest".to_string())
    }

    /// Returns the name to write, or `None` to leave the stored one alone.
    fn name_update(&self, existing: Option<&str>, offered: Option<&str>) -> Option<String> {
        let offered = offered.map(str::trim).filter(|n| !self.is_sentinel(n))?;
        match existing {
            Some(current) if !self.is_sentinel(current) => {
                if current != offered {
                    debug!(current, offered, "keeping previously learned display name");
                }
                None
            }
            _ => Some(offered.to_string()),
        }
    }

    pub async fn get_identity(&self, id: &str) -> Option<Identity> {
        if id.trim().is_empty() {
            return None;
        }
        self.store.get_identity(id).await
    }

    /// Looks up or creates the identity for an external platform sender.
    pub async fn resolve_platform_sender(
        &self,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Identity, ValidationError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(ValidationError::MissingIdentity);
        }
        let existing = self.store.get_identity(external_id).await;
        let patch = IdentityPatch {
            display_name: self.name_update(
                existing.as_ref().and_then(|i| i.display_name.as_deref()),
                display_name,
            ),
            is_external_platform_user: Some(true),
            last_active_at: Some(self.clock.now_millis()),
            last_message_text: None,
        };
        Ok(self.upsert_or_fallback(external_id, patch, existing).await)
    }

    /// Provisions (or refreshes) the guest identity for `client_token`.
    ///
    /// Idempotent: the same token always yields the same identity id.
    pub async fn provision_guest(
        &self,
        client_token: &str,
        display_name: Option<&str>,
    ) -> Result<Identity, ValidationError> {
        let id = guest_id_for_token(client_token)?;
        let existing = self.store.get_identity(&id).await;
        let display_name = match &existing {
            Some(identity) => self.name_update(identity.display_name.as_deref(), display_name),
            None => Some(
                display_name
                    .map(str::trim)
                    .filter(|n| !self.is_sentinel(n))
                    .map(str::to_string)
                    .unwrap_or_else(|| self.default_sentinel()),
            ),
        };
        let patch = IdentityPatch {
            display_name,
            is_external_platform_user: existing.is_none().then_some(false),
            last_active_at: Some(self.clock.now_millis()),
            last_message_text: None,
        };
        Ok(self.upsert_or_fallback(&id, patch, existing).await)
    }

    // A failed profile write must not block the message path.
    async fn upsert_or_fallback(
        &self,
        id: &str,
        patch: IdentityPatch,
        existing: Option<Identity>,
    ) -> Identity {
        match self.store.upsert_identity(id, patch.clone()).await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(identity_id = id, error = %err, "identity upsert failed");
                let mut identity = existing.unwrap_or_else(|| Identity::new(id));
                identity.apply(&patch);
                identity
            }
        }
    }
}
