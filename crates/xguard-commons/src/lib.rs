pub mod error;
pub mod models;
pub mod utils;

pub use error::ConfigError;
pub use models::*;
pub use utils::*;
