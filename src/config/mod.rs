//! Data model and host settings

pub mod schema;
pub mod settings;

pub use settings::Settings;
