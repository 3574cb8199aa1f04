pub mod cache;
pub mod session;

pub use cache::{CacheEvent, SessionCache};
pub use session::ViewerSession;
