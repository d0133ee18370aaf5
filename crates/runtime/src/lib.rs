//! Chromium lifecycle and DevTools connection plumbing.
//!
//! * [`launcher`] finds and starts a Chromium binary with remote debugging
//!   and waits for its DevTools endpoint.
//! * [`transport`] moves JSON messages over the DevTools WebSocket.
//! * [`connection`] correlates commands with responses and fans events out
//!   to subscribers.

pub mod connection;
mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake_transport;
mod finder;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod transport;

pub use connection::Connection;
pub use error::{Error, Result};
pub use finder::find_chrome_executable;
pub use launcher::{BrowserProcess, LaunchOptions};
