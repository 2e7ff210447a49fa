use crate::{WindowHandle, PRIMARY_WINDOW_ID};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("window id \"{0}\" is reserved for the primary window")]
    ReservedId(String),
    #[error("window id must not be empty")]
    EmptyId,
}

/// Maps application-level window ids to native handles. The primary window is
/// never stored in the map; the reserved id resolves to the primary field.
#[derive(Debug, Default, Clone)]
pub struct WindowRegistry {
    primary: Option<WindowHandle>,
    secondaries: BTreeMap<String, WindowHandle>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&mut self, handle: WindowHandle) {
        self.secondaries.retain(|_, existing| *existing != handle);
        self.primary = Some(handle);
    }

    pub fn clear_primary(&mut self) -> Option<WindowHandle> {
        self.primary.take()
    }

    pub fn primary(&self) -> Option<WindowHandle> {
        self.primary
    }

    /// Returns the handle previously registered under `id`, if any.
    pub fn register(
        &mut self,
        id: &str,
        handle: WindowHandle,
    ) -> Result<Option<WindowHandle>, RegistryError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if id == PRIMARY_WINDOW_ID || self.primary == Some(handle) {
            return Err(RegistryError::ReservedId(id.to_string()));
        }
        self.secondaries
            .retain(|existing_id, existing| existing_id == id || *existing != handle);
        Ok(self.secondaries.insert(id.to_string(), handle))
    }

    pub fn unregister(&mut self, id: &str) -> Option<WindowHandle> {
        self.secondaries.remove(id)
    }

    /// Removes whichever secondary id maps to `handle`.
    pub fn unregister_handle(&mut self, handle: WindowHandle) -> Option<String> {
        let id = self.secondary_id(handle)?;
        self.secondaries.remove(&id);
        Some(id)
    }

    pub fn resolve(&self, id: &str) -> Option<WindowHandle> {
        if id == PRIMARY_WINDOW_ID {
            return self.primary;
        }
        self.secondaries.get(id).copied()
    }

    pub fn reverse_resolve(&self, handle: WindowHandle) -> Option<String> {
        if self.primary == Some(handle) {
            return Some(PRIMARY_WINDOW_ID.to_string());
        }
        self.secondary_id(handle)
    }

    fn secondary_id(&self, handle: WindowHandle) -> Option<String> {
        self.secondaries
            .iter()
            .find(|(_, existing)| **existing == handle)
            .map(|(id, _)| id.clone())
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries.len()
    }

    pub fn secondary_handles(&self) -> Vec<WindowHandle> {
        self.secondaries.values().copied().collect()
    }

    /// Primary first, then secondaries in id order.
    pub fn all_handles(&self) -> Vec<WindowHandle> {
        self.primary
            .into_iter()
            .chain(self.secondaries.values().copied())
            .collect()
    }
}
