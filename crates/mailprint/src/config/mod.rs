pub mod loader;
pub mod schema;

pub use loader::{
    default_config_dir, load_config, load_config_from_str, load_or_init, save_config,
    validate_config, CONFIG_FILE,
};
pub use schema::{Config, GoogleSettings, ImapAuth, ImapSettings, DEFAULT_PRINTER};
