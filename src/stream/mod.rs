//! Blocking byte streams over non-blocking sockets.
//!
//! Upper-layer protocol code is written against plain [`std::io::Read`] and
//! [`std::io::Write`]. This module adapts a runtime-registered socket to that
//! contract:
//!
//! - `channel`: the shared socket, read-ahead buffer, and once-only close
//!   notification.
//! - `input` / `output`: the blocking halves.
//! - `watcher`: the single background task that notices remote close while
//!   no one is reading.

pub mod channel;
pub mod input;
pub mod output;
pub mod watcher;

pub use channel::{Channel, ChannelOptions, CloseCallback};
pub use input::ChannelInput;
pub use output::ChannelOutput;
pub use watcher::CloseWatcher;
