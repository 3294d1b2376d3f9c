pub mod config_model;
pub mod node_model;

pub use config_model::*;
pub use node_model::*;
