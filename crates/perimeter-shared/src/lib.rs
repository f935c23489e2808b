pub mod alert_models;
pub mod errors;
pub mod models;

pub use alert_models::*;
pub use errors::*;
pub use models::*;
