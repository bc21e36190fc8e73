//! Shared application state

use crate::catalog::ServerCatalog;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server catalog (store, supervisor and discovery)
    pub catalog: ServerCatalog,
}

impl AppState {
    pub fn new(catalog: ServerCatalog) -> Self {
        Self { catalog }
    }
}
