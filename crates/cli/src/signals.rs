//! Termination signals.

use tracing::{info, warn};

/// Resolves on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(target = "pixelcast", error = %e, "cannot listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				tokio::select! {
					_ = ctrl_c => info!(target = "pixelcast", "received SIGINT"),
					_ = sigterm.recv() => info!(target = "pixelcast", "received SIGTERM"),
				}
			}
			Err(e) => {
				warn!(target = "pixelcast", error = %e, "cannot listen for SIGTERM");
				ctrl_c.await;
			}
		}
	}

	#[cfg(not(unix))]
	{
		ctrl_c.await;
		info!(target = "pixelcast", "received ctrl-c");
	}
}
