pub mod error;
pub mod session;

pub use error::StoreError;
pub use session::{
    ActiveSession,
    BannedEntry,
    SessionStore,
};
