pub mod catalog;
pub mod extract;
pub mod fsops;
pub mod harvest;
pub mod keypoints;
pub mod ledger;
pub mod matcher;
pub mod store;
pub mod triage;
pub mod vision;

pub use catalog::{CatalogEntry, Cluster, DirectoryStats, FailureList, Shape};
pub use matcher::{MatchEngine, MatchParams, Pools};
pub use store::{ResultStore, StoreHeader, StoredRun};
pub use triage::{EntryRef, Triage};
pub use vision::{Method, Signature, Vision};
