pub mod cli;
pub mod config;
pub mod event;
pub mod watcher;
pub mod watchpoint;

pub use config::WatchpointConfig;
pub use event::*;
pub use watcher::*;
pub use watchpoint::*;
