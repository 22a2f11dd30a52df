//! AuthStore - per-listing credential storage.
//!
//! Wraps the `local_auth` document store: one record per listing holding the
//! tokens of every user who has logged in there, plus a pointer to the
//! current username. Token issuance and refresh live elsewhere; the engine
//! only resolves "the token to use for this listing right now".

use crate::doc_store::{DocStore, StoreError};
use outpost_model::ListingId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthRecord {
    #[serde(default)]
    pub available_tokens: HashMap<String, String>,
    #[serde(default)]
    pub current_username: Option<String>,
}

#[derive(Clone)]
pub struct AuthStore {
    db: Arc<DocStore>,
}

impl AuthStore {
    pub fn new(db: Arc<DocStore>) -> Self {
        Self { db }
    }

    pub fn store(&self) -> &Arc<DocStore> {
        &self.db
    }

    /// Store a user's token for a listing and make that user current.
    pub fn set_token(
        &self,
        listing_id: &ListingId,
        username: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let mut record: AuthRecord = self
            .db
            .get_as(listing_id.as_str())?
            .unwrap_or_default();
        record
            .available_tokens
            .insert(username.to_string(), token.to_string());
        record.current_username = Some(username.to_string());
        self.db.put_as(listing_id.as_str(), &record)?;
        Ok(())
    }

    pub fn set_current_username(
        &self,
        listing_id: &ListingId,
        username: &str,
    ) -> Result<(), StoreError> {
        let mut record: AuthRecord = self
            .db
            .get_as(listing_id.as_str())?
            .unwrap_or_default();
        record.current_username = Some(username.to_string());
        self.db.put_as(listing_id.as_str(), &record)?;
        Ok(())
    }

    /// Resolve the token to use for a listing: the current user's token,
    /// falling back to any stored one. `None` means "waiting on login".
    pub fn token_for_listing(&self, listing_id: &ListingId) -> Result<Option<String>, StoreError> {
        let Some(record) = self.db.get_as::<AuthRecord>(listing_id.as_str())? else {
            return Ok(None);
        };
        if let Some(username) = &record.current_username {
            if let Some(token) = record.available_tokens.get(username) {
                return Ok(Some(token.clone()));
            }
        }
        Ok(record.available_tokens.values().next().cloned())
    }

    /// Forget all credentials for a listing.
    pub fn clear(&self, listing_id: &ListingId) -> Result<(), StoreError> {
        self.db.remove(listing_id.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, AuthStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = AuthStore::new(Arc::new(
            DocStore::open(tmp.path().join("local_auth.redb"), "local_auth").unwrap(),
        ));
        (tmp, store)
    }

    #[test]
    fn current_user_token_wins() {
        let (_tmp, store) = open_store();
        let listing = ListingId::from("srv.example.org");

        assert!(store.token_for_listing(&listing).unwrap().is_none());

        store.set_token(&listing, "alice", "tok-alice").unwrap();
        store.set_token(&listing, "bob", "tok-bob").unwrap();
        // bob logged in last and is current
        assert_eq!(
            store.token_for_listing(&listing).unwrap().as_deref(),
            Some("tok-bob")
        );

        store.set_current_username(&listing, "alice").unwrap();
        assert_eq!(
            store.token_for_listing(&listing).unwrap().as_deref(),
            Some("tok-alice")
        );

        store.clear(&listing).unwrap();
        assert!(store.token_for_listing(&listing).unwrap().is_none());
    }
}
