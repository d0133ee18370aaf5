use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures talking to or managing a Chromium instance.
#[derive(Debug, Error)]
pub enum Error {
	#[error("browser launch failed: {0}")]
	Launch(String),

	#[error("devtools transport error: {0}")]
	Transport(String),

	#[error("devtools protocol error {code}: {message}")]
	Protocol { code: i64, message: String },

	#[error("devtools connection closed")]
	ChannelClosed,

	#[error("devtools command `{method}` timed out after {ms}ms")]
	Timeout { method: String, ms: u64 },

	#[error("devtools endpoint unavailable: {0}")]
	Http(String),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Returns `true` when the error means the browser side is gone.
	pub fn is_disconnect(&self) -> bool {
		matches!(self, Error::ChannelClosed | Error::Transport(_))
	}
}
