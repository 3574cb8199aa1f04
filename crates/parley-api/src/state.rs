use std::sync::Arc;

use parley_sync::Synchronizer;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub sync: Synchronizer,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(sync: Synchronizer, jwt_secret: impl Into<String>) -> AppState {
        Arc::new(Self {
            sync,
            jwt_secret: jwt_secret.into(),
        })
    }
}
