use crate::store::SharedStore;

/// Shared gateway state: the gateway is purely translational, so a store
/// handle is all it carries.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
}

impl AppState {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}
