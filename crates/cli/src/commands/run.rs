use pixelcast::{Outcome, SessionFactory, StreamConfig};
use tracing::{error, info};

use crate::signals::shutdown_signal;

pub async fn execute(config: StreamConfig) -> anyhow::Result<i32> {
	config.validate()?;
	info!(
		target = "pixelcast",
		version = env!("CARGO_PKG_VERSION"),
		url = %config.browser.url,
		rtmp_server = %config.transcode.rtmp_server,
		resolution = %format!("{}x{}", config.transcode.width, config.transcode.height),
		fps = config.transcode.fps,
		"starting stream"
	);

	let manager = SessionFactory::new(config).into_manager();
	let stop = manager.stop_handle();
	let signals = tokio::spawn(async move {
		shutdown_signal().await;
		info!(target = "pixelcast", "shutting down");
		stop.stop();
	});

	let outcome = manager.run().await;
	signals.abort();

	match &outcome {
		Outcome::Stopped => info!(target = "pixelcast", "stream stopped"),
		Outcome::Exhausted { restarts } => {
			error!(target = "pixelcast", restarts, "giving up after repeated failures");
		}
		Outcome::Failed(e) => error!(target = "pixelcast", error = %e, "stream cannot start"),
	}
	Ok(outcome.exit_code())
}
