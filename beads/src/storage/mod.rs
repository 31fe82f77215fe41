pub mod store;

use serde_derive::{Deserialize, Serialize};

/// Issue counts by lifecycle status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub deferred: usize,
    pub closed: usize,
    pub tombstone: usize,
}
