//! The plugin's Unix socket transport. tonic has no built-in Unix socket
//! support, so the server side wraps a listener that also manages the
//! socket file's lifecycle (directory creation, stale socket removal,
//! cleanup on drop), and the client side builds a channel with a custom
//! connector, with optional retry for plugins that are still starting.

pub mod client;
pub mod server;
