use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by pipeline steps.
///
/// Runtime failures that happen after a step succeeded travel as
/// [`Fault`](crate::Fault)s instead.
#[derive(Debug, Error)]
pub enum Error {
	#[error("configuration error: {0}")]
	Config(String),

	#[error("browser launch failed: {0}")]
	Launch(String),

	#[error("navigation failed: {0}")]
	Navigation(String),

	#[error("timed out after {}ms waiting for {what}", after.as_millis())]
	Timeout { what: String, after: Duration },

	#[error("failed to bind relay on {addr}: {source}")]
	Bind {
		addr: SocketAddr,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to start `{program}`: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("capture setup failed: {0}")]
	Capture(String),

	#[error("page script threw: {0}")]
	Script(String),

	#[error(transparent)]
	Cdp(#[from] pixelcast_runtime::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
		Error::Timeout {
			what: what.into(),
			after,
		}
	}

	/// Everything except a configuration problem is worth another attempt.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, Error::Config(_))
	}
}
