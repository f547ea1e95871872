//! CLI command implementations

mod auth;
mod config;
mod run;
mod service;
mod status;
mod transfer;
mod tunnel;

pub use auth::login_command;
pub use config::{config_get, config_path, config_set, config_show, SETTINGS_KEYS};
pub use run::{run_command, stop_command};
pub use service::{add_command, list_command, remove_command};
pub use status::{status_command, version_command};
pub use transfer::{export_command, import_command};
pub use tunnel::{clean_command, init_command, switch_command};
