use uuid::Uuid;

use parley_db::{Database, StoreError};
use parley_types::models::Profile;

/// Read-only access to display data owned by the surrounding application.
/// Blocking, like the store.
pub trait ProfileLookup: Send + Sync + 'static {
    fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;
}

impl ProfileLookup for Database {
    fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        Database::get_profile(self, user_id)
    }
}
