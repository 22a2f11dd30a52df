//! Outpost Store
//!
//! Device-local persistence for the Outpost sync engine:
//! - **DataDir**: platform paths for every persisted store
//! - **DocStore**: a redb-backed document store with a live change feed
//! - **StorePool**: get-or-open cache of per-(prefix, id) stores
//! - **ActiveStore / AuthStore**: typed wrappers over the `active` and
//!   `local_auth` stores

pub mod active_store;
pub mod auth_store;
pub mod data_dir;
pub mod doc_store;
pub mod feed;
pub mod pool;

pub use active_store::ActiveStore;
pub use auth_store::AuthStore;
pub use data_dir::DataDir;
pub use doc_store::{DocStore, StoreError};
pub use feed::{ChangeEvent, ChangeFeed, ChangeOrigin, ChangeSubscription};
pub use pool::StorePool;
