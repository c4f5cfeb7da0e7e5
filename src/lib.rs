//! Threadwatch - an event-watcher dispatcher for task platforms.
//!
//! Threadwatch monitors code forges, issue trackers, and chat workspaces
//! (webhooks plus polling), normalizes what happens there into a single
//! event shape, and runs a user-configured command for each actionable
//! event. Coordination with the source platform happens entirely through
//! the conversation thread: the watcher acknowledges work with a comment,
//! and skips any resource whose latest comment is already its own.

pub mod bus;
pub mod config;
pub mod event;
pub mod executor;
pub mod poller;
pub mod provider;
pub mod reactor;
pub mod retry;
pub mod secret;
pub mod server;
pub mod signature;
pub mod template;
pub mod watcher;

pub use config::WatcherConfig;
pub use event::NormalizedEvent;
pub use watcher::{Watcher, WatcherError};
