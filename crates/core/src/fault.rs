//! Runtime failure signals raised by running components.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Something went wrong after a pipeline step had already succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
	#[error("browser page crashed: {0}")]
	BrowserCrashed(String),

	#[error("browser went away: {0}")]
	BrowserExited(String),

	#[error("transcoder exited unexpectedly ({})", describe_code(.code))]
	TranscoderExited { code: Option<i32> },

	#[error("transcoder reported a fatal error: {0}")]
	TranscoderFatal(String),

	#[error("transcoder {0} input closed")]
	InputClosed(&'static str),

	#[error("video producer did not reconnect within {0:?}")]
	ProducerLost(Duration),

	#[error("task `{task}` panicked: {message}")]
	TaskPanicked { task: String, message: String },
}

fn describe_code(code: &Option<i32>) -> String {
	match code {
		Some(code) => format!("exit code {code}"),
		None => "killed by signal".to_string(),
	}
}

/// Sending side of an attempt's fault channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FaultSender {
	tx: mpsc::UnboundedSender<Fault>,
}

pub type FaultReceiver = mpsc::UnboundedReceiver<Fault>;

pub fn fault_channel() -> (FaultSender, FaultReceiver) {
	let (tx, rx) = mpsc::unbounded_channel();
	(FaultSender { tx }, rx)
}

impl FaultSender {
	/// Reports a fault. Ignored once the attempt has been abandoned.
	pub fn raise(&self, fault: Fault) {
		debug!(target = "pixelcast.recovery", %fault, "fault raised");
		let _ = self.tx.send(fault);
	}
}

/// Spawns `future`, turning a panic into [`Fault::TaskPanicked`].
pub fn spawn_supervised<F>(task: &'static str, faults: FaultSender, future: F) -> JoinHandle<()>
where
	F: Future<Output = ()> + Send + 'static,
{
	tokio::spawn(async move {
		if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
			faults.raise(Fault::TaskPanicked {
				task: task.to_string(),
				message: panic_message(payload.as_ref()),
			});
		}
	})
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
