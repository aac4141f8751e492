use super::{CacheError, SightingCache};
use crate::validation::Lookup;
use altfinder_db::{CorruptRow, Sighting};
use async_trait::async_trait;
use std::collections::HashSet;

/// No cache: every read goes to the store.
pub struct DisabledCache;

#[async_trait]
impl SightingCache for DisabledCache {
    async fn get(&self, _lookup: &Lookup) -> Result<Option<HashSet<Sighting>>, CacheError> {
        Ok(None)
    }

    async fn put(&self, _sighting: &Sighting) -> Result<(), CacheError> {
        Ok(())
    }

    async fn evict(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn evict_corrupt(&self, _rows: &[CorruptRow]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
