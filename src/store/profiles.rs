// SPDX-License-Identifier: MPL-2.0

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use crate::backend::types::ProfileRow;
use crate::backend::{ClientError, DataService};
use crate::config::PROFILE_BATCH_LIMIT;

/// Author-summary cache shared across a view's stores.
///
/// Lookups are batched: when an event burst references authors we have not
/// seen, `ensure` resolves all of them in one request per batch-limit chunk
/// instead of one request per row.
pub struct ProfileDirectory {
    profiles: RwLock<HashMap<String, ProfileRow>>,
}

impl ProfileDirectory {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<ProfileRow> {
        self.profiles.read().unwrap().get(id).cloned()
    }

    pub fn insert_all(&self, rows: Vec<ProfileRow>) {
        let mut profiles = self.profiles.write().unwrap();
        for row in rows {
            profiles.insert(row.id.clone(), row);
        }
    }

    /// Ids not yet cached, deduplicated, in first-seen order.
    pub fn missing<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let profiles = self.profiles.read().unwrap();
        let mut seen = HashSet::new();
        ids.into_iter()
            .filter(|id| !profiles.contains_key(*id))
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Resolve any of `ids` that are not cached yet and back-fill the
    /// directory. Returns the newly fetched rows so the caller can patch
    /// affected view records.
    pub async fn ensure(
        &self,
        service: &dyn DataService,
        ids: Vec<String>,
    ) -> Result<Vec<ProfileRow>, ClientError> {
        let wanted = self.missing(ids.iter().map(String::as_str));
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = wanted.len(), "resolving missing author profiles");
        let mut fetched = Vec::with_capacity(wanted.len());
        for chunk in wanted.chunks(PROFILE_BATCH_LIMIT) {
            let rows = service.profiles_by_ids(chunk).await?;
            fetched.extend(rows);
        }
        self.insert_all(fetched.clone());
        Ok(fetched)
    }
}

impl Default for ProfileDirectory {
    fn default() -> Self {
        Self::new()
    }
}
