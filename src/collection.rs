//! Owning collections of media objects
//!
//! Removing an object disposes it and frees any device buffer it still holds.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::backend::ComputeBackend;
use crate::media::{MediaId, MediaObject};
use crate::session::AcceleratorSession;

#[derive(Debug)]
pub struct MediaCollection<T: MediaObject> {
    items: BTreeMap<MediaId, T>,
}

impl<T: MediaObject> MediaCollection<T> {
    pub fn new() -> Self {
        Self { items: BTreeMap::new() }
    }

    pub fn add(&mut self, item: T) -> MediaId {
        let id = item.id();
        debug!("Added media {} '{}'", id, item.name());
        self.items.insert(id, item);
        id
    }

    pub fn get(&self, id: MediaId) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: MediaId) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    /// Dispose and drop one object. Returns the device bytes freed, `None` if unknown.
    pub fn remove<B: ComputeBackend>(&mut self, id: MediaId, session: &mut AcceleratorSession<B>) -> Option<u64> {
        let mut item = self.items.remove(&id)?;
        let freed = session.free(item.release());
        debug!("Removed media {} ({} bytes freed)", id, freed);
        Some(freed)
    }

    /// Dispose everything. Returns the device bytes freed.
    pub fn clear<B: ComputeBackend>(&mut self, session: &mut AcceleratorSession<B>) -> u64 {
        let count = self.items.len();
        let freed = std::mem::take(&mut self.items)
            .into_values()
            .map(|mut item| session.free(item.release()))
            .sum();
        info!("Cleared {} media object(s), {} kB freed", count, freed / 1024);
        freed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<MediaId> {
        self.items.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }
}

impl<T: MediaObject> Default for MediaCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}
