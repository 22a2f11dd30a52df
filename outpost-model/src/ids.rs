//! Identifier newtypes for listings and projects.
//!
//! A project id is only unique within its listing; the full project id joins
//! the two with [`ID_SEPARATOR`] and is the key used by every per-project
//! registry in the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between the listing id and the project id in a full project id.
pub const ID_SEPARATOR: &str = "||";

#[derive(Error, Debug)]
pub enum IdError {
    #[error("malformed full project id: {0}")]
    Malformed(String),
}

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(ListingId, "Identifies a registered remote server (a listing).");
define_id!(ProjectId, "Identifies a project within one listing (not globally unique).");
define_id!(
    FullProjectId,
    "Globally unique project id: `listing_id || project_id`."
);

impl FullProjectId {
    /// Join a listing id and a per-listing project id into the unique form.
    pub fn resolve(listing_id: &ListingId, project_id: &ProjectId) -> Self {
        Self(format!(
            "{}{}{}",
            listing_id.as_str(),
            ID_SEPARATOR,
            project_id.as_str()
        ))
    }

    /// Split back into the (listing, project) pair.
    pub fn split(&self) -> Result<(ListingId, ProjectId), IdError> {
        let (listing, project) = self
            .0
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| IdError::Malformed(self.0.clone()))?;
        if listing.is_empty() || project.is_empty() {
            return Err(IdError::Malformed(self.0.clone()));
        }
        Ok((ListingId::from(listing), ProjectId::from(project)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_and_split_round_trip() {
        let listing = ListingId::from("srv.example.org");
        let project = ProjectId::from("survey-2024");
        let full = FullProjectId::resolve(&listing, &project);
        assert_eq!(full.as_str(), "srv.example.org||survey-2024");

        let (l, p) = full.split().unwrap();
        assert_eq!(l, listing);
        assert_eq!(p, project);
    }

    #[test]
    fn split_rejects_malformed_ids() {
        assert!(FullProjectId::from("no-separator").split().is_err());
        assert!(FullProjectId::from("||project").split().is_err());
        assert!(FullProjectId::from("listing||").split().is_err());
    }
}
