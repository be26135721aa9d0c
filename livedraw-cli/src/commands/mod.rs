pub mod admin;
pub mod serve;
pub mod status;

pub use admin::{handle_admin_command, AdminCommands};
pub use serve::{handle_serve_command, ServeArgs};
pub use status::handle_status_command;
