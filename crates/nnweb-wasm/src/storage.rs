//! `localStorage`-backed state store.

use nnweb_core::{StateError, StateStore};
use wasm_bindgen::JsValue;
use web_sys::Storage;

use crate::bridge::js_error;

/// Persists crash state in the page's `localStorage`.
pub struct LocalStorageStore {
    storage: Storage,
}

impl LocalStorageStore {
    /// Open the window's `localStorage`. Fails in workers and when storage
    /// is disabled.
    pub fn open() -> Result<Self, StateError> {
        let window = web_sys::window().ok_or_else(|| StateError::Unavailable("no window".into()))?;
        let storage = window
            .local_storage()
            .map_err(unavailable)?
            .ok_or_else(|| StateError::Unavailable("localStorage is disabled".into()))?;
        Ok(Self { storage })
    }
}

fn unavailable(err: JsValue) -> StateError {
    StateError::Unavailable(js_error(&err))
}

impl StateStore for LocalStorageStore {
    fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        self.storage.get_item(key).map_err(unavailable)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        self.storage.set_item(key, value).map_err(unavailable)
    }

    fn remove(&self, key: &str) -> Result<(), StateError> {
        self.storage.remove_item(key).map_err(unavailable)
    }
}
