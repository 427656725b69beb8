pub mod loader;

pub use loader::{load_config_for_model, load_external_model, save_model};
