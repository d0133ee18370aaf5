//! Supervised capture pipeline: headless browser -> relay -> ffmpeg -> RTMP.
//!
//! A [`Session`](session::Session) is one attempt at bringing the pipeline up:
//!
//! * [`browser`] launches Chromium, loads the page and surfaces crashes.
//! * [`audio`] taps the page's Web Audio graph into raw PCM.
//! * [`relay`] receives the in-page `MediaRecorder` output over a local WebSocket.
//! * [`transcode`] owns the ffmpeg child that re-encodes and publishes.
//!
//! [`RecoveryManager`](recovery::RecoveryManager) drives sessions through their
//! states, tears them down on any fault and restarts with backoff.

pub mod audio;
pub mod browser;
pub mod config;
mod error;
pub mod fault;
pub mod recovery;
pub mod relay;
pub mod session;
pub mod transcode;

pub use config::{RestartPolicy, StreamConfig};
pub use error::{Error, Result};
pub use fault::Fault;
pub use recovery::{Outcome, RecoveryManager, SessionState, SessionStatus};
pub use session::{Session, SessionFactory};
