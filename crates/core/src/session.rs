//! One attempt at the real pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audio::{AudioCapture, AudioTap};
use crate::browser::{BrowserSession, Signal};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::fault::FaultSender;
use crate::recovery::{HealthReport, Pipeline, PipelineFactory, RecoveryManager};
use crate::relay::VideoRelay;
use crate::transcode::{TranscodeSettings, TranscodeSupervisor};

/// Browser, relay, audio tap and transcoder for a single attempt.
///
/// Never reused: a restart builds a new one through [`SessionFactory`].
pub struct Session {
	config: Arc<StreamConfig>,
	faults: FaultSender,
	browser: Option<BrowserSession>,
	relay: Option<VideoRelay>,
	audio_forwarder: Option<JoinHandle<()>>,
	audio_enabled: bool,
	transcoder: Option<TranscodeSupervisor>,
}

impl Session {
	pub fn new(config: Arc<StreamConfig>, faults: FaultSender) -> Self {
		Self {
			config,
			faults,
			browser: None,
			relay: None,
			audio_forwarder: None,
			audio_enabled: false,
			transcoder: None,
		}
	}

	fn browser(&self) -> Result<&BrowserSession> {
		self.browser
			.as_ref()
			.ok_or_else(|| Error::Capture("browser is not open".to_string()))
	}
}

#[async_trait]
impl Pipeline for Session {
	async fn open_browser(&mut self) -> Result<()> {
		let config = &self.config.browser;
		let browser = self.browser.insert(BrowserSession::launch(config, self.faults.clone()).await?);

		browser.navigate(&config.url, config.navigation_timeout).await?;
		browser
			.wait_for_signal(&Signal::Selector(config.canvas_selector.clone()), config.canvas_timeout)
			.await?;

		info!(
			target = "pixelcast.browser",
			settle_ms = config.settle_delay.as_millis() as u64,
			"page ready, letting it settle"
		);
		tokio::time::sleep(config.settle_delay).await;
		Ok(())
	}

	async fn arm_capture(&mut self) -> Result<()> {
		let config = Arc::clone(&self.config);
		self.browser()?;

		let relay = self.relay.insert(VideoRelay::bind(&config.relay, self.faults.clone()).await?);
		let video = relay
			.take_output()
			.ok_or_else(|| Error::Capture("relay output already taken".to_string()))?;

		let browser = self.browser()?;
		let audio = match AudioTap::install(browser, &config.capture).await {
			AudioCapture::Enabled(stream) => {
				self.audio_forwarder = Some(stream.forwarder);
				self.audio_enabled = true;
				Some(stream.frames)
			}
			AudioCapture::Disabled => None,
		};

		let settings = TranscodeSettings::from_config(&config);
		self.transcoder = Some(TranscodeSupervisor::start(settings, video, audio, self.faults.clone()).await?);

		let (Some(browser), Some(relay)) = (self.browser.as_ref(), self.relay.as_ref()) else {
			return Err(Error::Capture("capture torn down while arming".to_string()));
		};
		relay.arm_recorder(browser, &config).await
	}

	async fn await_producer(&mut self, timeout: Duration) -> Result<()> {
		let relay = self
			.relay
			.as_ref()
			.ok_or_else(|| Error::Capture("relay is not bound".to_string()))?;
		relay.wait_for_producer(timeout).await?;
		info!(target = "pixelcast.relay", "recorder connected");
		Ok(())
	}

	async fn teardown(&mut self) {
		if let Some(mut transcoder) = self.transcoder.take() {
			transcoder.stop().await;
		}
		if let Some(mut relay) = self.relay.take() {
			relay.close().await;
		}
		if let Some(forwarder) = self.audio_forwarder.take() {
			forwarder.abort();
		}
		self.audio_enabled = false;
		if let Some(mut browser) = self.browser.take() {
			browser.close().await;
		}
		debug!(target = "pixelcast.recovery", "session torn down");
	}

	fn health(&self) -> HealthReport {
		let stats = self.relay.as_ref().map(VideoRelay::stats).unwrap_or_default();
		HealthReport {
			producer_connected: self.relay.as_ref().is_some_and(VideoRelay::is_connected),
			transcoder_running: self.transcoder.as_ref().is_some_and(TranscodeSupervisor::is_running),
			audio_enabled: self.audio_enabled,
			chunks: stats.chunks,
			megabytes: stats.megabytes(),
		}
	}
}

/// Builds a fresh [`Session`] per attempt from one shared configuration.
#[derive(Debug, Clone)]
pub struct SessionFactory {
	config: Arc<StreamConfig>,
}

impl SessionFactory {
	pub fn new(config: StreamConfig) -> Self {
		Self {
			config: Arc::new(config),
		}
	}

	/// A manager restarting sessions under the configured policy.
	pub fn into_manager(self) -> RecoveryManager {
		let restart = self.config.restart.clone();
		let producer_timeout = self.config.relay.producer_timeout;
		let health_interval = self.config.relay.health_interval;
		RecoveryManager::new(self, restart, producer_timeout, health_interval)
	}
}

impl PipelineFactory for SessionFactory {
	fn build(&self, faults: FaultSender) -> Box<dyn Pipeline> {
		Box::new(Session::new(Arc::clone(&self.config), faults))
	}
}
