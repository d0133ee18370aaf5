//! Pipeline configuration.
//!
//! [`StreamConfig`] is plain serde data with defaults for everything except the
//! stream key. The CLI layers a JSON file and flags/environment on top and then
//! calls [`StreamConfig::validate`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AUDIO_CHANNELS;
use crate::error::{Error, Result};

pub const DEFAULT_RTMP_SERVER: &str = "rtmp://live.twitch.tv/app";
pub const DEFAULT_PAGE_URL: &str = "http://localhost:3000/script.html?autoplay=true";
pub const DEFAULT_RELAY_PORT: u16 = 3001;

const REDACTED: &str = "****";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
	pub browser: BrowserConfig,
	pub capture: CaptureConfig,
	pub relay: RelayConfig,
	pub transcode: TranscodeConfig,
	pub restart: RestartPolicy,
}

/// Page loading and readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
	pub url: String,
	/// Chromium binary; discovered on `PATH` and in standard locations when unset.
	pub executable: Option<PathBuf>,
	pub headless: bool,
	/// Viewport and window size, which is also the capture resolution.
	pub width: u32,
	pub height: u32,
	pub extra_args: Vec<String>,
	#[serde(with = "millis")]
	pub startup_timeout: Duration,
	#[serde(with = "millis")]
	pub navigation_timeout: Duration,
	/// Element that must exist before the page counts as loaded.
	pub canvas_selector: String,
	#[serde(with = "millis")]
	pub canvas_timeout: Duration,
	/// Selector proving real content is on screen rather than a loading placeholder.
	pub content_selector: String,
	#[serde(with = "millis")]
	pub content_timeout: Duration,
	/// Pause after the page is ready, before capture is armed.
	#[serde(with = "millis")]
	pub settle_delay: Duration,
	#[serde(with = "millis")]
	pub poll_interval: Duration,
}

impl Default for BrowserConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_PAGE_URL.to_string(),
			executable: None,
			headless: true,
			width: 960,
			height: 960,
			extra_args: Vec::new(),
			startup_timeout: Duration::from_secs(15),
			navigation_timeout: Duration::from_secs(30),
			canvas_selector: "canvas".to_string(),
			canvas_timeout: Duration::from_secs(10),
			content_selector: "#dialogue-lines .dialogue-line".to_string(),
			content_timeout: Duration::from_secs(30),
			settle_delay: Duration::from_secs(3),
			poll_interval: Duration::from_millis(100),
		}
	}
}

/// In-page capture: the audio tap and the canvas recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
	pub audio_enabled: bool,
	/// Expression evaluating to the page's `AudioContext`.
	pub audio_graph: String,
	#[serde(with = "millis")]
	pub audio_timeout: Duration,
	pub sample_rate: u32,
	pub channels: u16,
	/// Element id of the canvas to record.
	pub canvas_id: String,
	/// Rate passed to `canvas.captureStream`.
	pub capture_fps: u32,
	/// Tried in order; the first one `MediaRecorder` supports wins.
	pub mime_types: Vec<String>,
	pub timeslice_ms: u32,
	pub recorder_bits_per_second: u64,
}

impl Default for CaptureConfig {
	fn default() -> Self {
		Self {
			audio_enabled: true,
			audio_graph: "audioContext".to_string(),
			audio_timeout: Duration::from_secs(10),
			sample_rate: 48_000,
			channels: AUDIO_CHANNELS,
			canvas_id: "canvas".to_string(),
			capture_fps: 60,
			mime_types: vec!["video/webm;codecs=vp9".to_string(), "video/webm;codecs=vp8".to_string()],
			timeslice_ms: 100,
			recorder_bits_per_second: 4_000_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
	/// Loopback port; 0 picks a free one.
	pub port: u16,
	pub max_payload: usize,
	#[serde(with = "millis")]
	pub producer_timeout: Duration,
	/// How long a disconnected producer may take to come back before the
	/// attempt is failed.
	#[serde(with = "millis")]
	pub reconnect_timeout: Duration,
	/// How often a streaming session logs its health.
	#[serde(with = "millis")]
	pub health_interval: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			port: DEFAULT_RELAY_PORT,
			max_payload: 10 * 1024 * 1024,
			producer_timeout: Duration::from_secs(30),
			reconnect_timeout: Duration::from_secs(10),
			health_interval: Duration::from_secs(60),
		}
	}
}

/// Encoder and publish target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
	pub ffmpeg: PathBuf,
	pub rtmp_server: String,
	pub stream_key: Option<String>,
	pub width: u32,
	pub height: u32,
	pub fps: u32,
	pub video_bitrate: String,
	pub max_bitrate: String,
	pub buffer_size: String,
	pub audio_bitrate: String,
	/// Frames between keyframes; `fps * 2` when unset.
	pub keyframe_interval: Option<u32>,
	#[serde(with = "millis")]
	pub stop_grace: Duration,
	/// One in this many progress lines is logged.
	pub progress_sample_every: u32,
}

impl Default for TranscodeConfig {
	fn default() -> Self {
		Self {
			ffmpeg: PathBuf::from("ffmpeg"),
			rtmp_server: DEFAULT_RTMP_SERVER.to_string(),
			stream_key: None,
			width: 960,
			height: 960,
			fps: 30,
			video_bitrate: "2500k".to_string(),
			max_bitrate: "3000k".to_string(),
			buffer_size: "6000k".to_string(),
			audio_bitrate: "128k".to_string(),
			keyframe_interval: None,
			stop_grace: Duration::from_secs(1),
			progress_sample_every: 50,
		}
	}
}

impl TranscodeConfig {
	pub fn keyframe_interval(&self) -> u32 {
		self.keyframe_interval.unwrap_or(self.fps * 2)
	}
}

/// Restart bounds. The evolving counters live in
/// [`Backoff`](crate::recovery::Backoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
	pub max_restarts: u32,
	#[serde(with = "millis")]
	pub initial_delay: Duration,
	#[serde(with = "millis")]
	pub max_delay: Duration,
	pub multiplier: f64,
}

impl Default for RestartPolicy {
	fn default() -> Self {
		Self {
			max_restarts: 10,
			initial_delay: Duration::from_millis(5000),
			max_delay: Duration::from_millis(60_000),
			multiplier: 1.5,
		}
	}
}

impl StreamConfig {
	/// Loads a JSON file; missing fields keep their defaults.
	pub fn from_file(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
		serde_json::from_str(&text).map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))
	}

	pub fn validate(&self) -> Result<()> {
		match self.transcode.stream_key.as_deref().map(str::trim) {
			None | Some("") => {
				return Err(Error::Config(
					"stream key is missing; set STREAM_KEY or pass --stream-key".to_string(),
				));
			}
			Some(_) => {}
		}

		if self.transcode.rtmp_server.trim().is_empty() {
			return Err(Error::Config("rtmp server must not be empty".to_string()));
		}

		let dimensions = [
			("browser.width", self.browser.width),
			("browser.height", self.browser.height),
			("transcode.width", self.transcode.width),
			("transcode.height", self.transcode.height),
			("transcode.fps", self.transcode.fps),
			("capture.capture_fps", self.capture.capture_fps),
			("capture.sample_rate", self.capture.sample_rate),
		];
		if let Some((name, _)) = dimensions.iter().find(|(_, value)| *value == 0) {
			return Err(Error::Config(format!("{name} must be greater than zero")));
		}

		if self.capture.channels != AUDIO_CHANNELS {
			return Err(Error::Config(format!(
				"capture.channels must be {AUDIO_CHANNELS}, the audio tap always produces interleaved stereo, got {}",
				self.capture.channels
			)));
		}

		if self.capture.mime_types.is_empty() {
			return Err(Error::Config("capture.mime_types must list at least one type".to_string()));
		}

		let policy = &self.restart;
		if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
			return Err(Error::Config(format!(
				"restart.multiplier must be a finite number of at least 1, got {}",
				policy.multiplier
			)));
		}
		if policy.max_delay < policy.initial_delay {
			return Err(Error::Config(
				"restart.max_delay must not be smaller than restart.initial_delay".to_string(),
			));
		}

		Ok(())
	}

	/// Copy safe to print or log.
	pub fn redacted(&self) -> Self {
		let mut copy = self.clone();
		if copy.transcode.stream_key.is_some() {
			copy.transcode.stream_key = Some(REDACTED.to_string());
		}
		copy
	}
}

/// Replaces every occurrence of `secret` in `text`.
pub fn redact(text: &str, secret: Option<&str>) -> String {
	match secret {
		Some(secret) if !secret.is_empty() => text.replace(secret, REDACTED),
		_ => text.to_string(),
	}
}

/// Serializes a [`Duration`] as whole milliseconds.
mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn valid() -> StreamConfig {
		let mut config = StreamConfig::default();
		config.transcode.stream_key = Some("live_123_abc".into());
		config
	}

	#[test]
	fn defaults_match_reference_deployment() {
		let config = StreamConfig::default();
		assert_eq!(config.browser.url, DEFAULT_PAGE_URL);
		assert_eq!((config.browser.width, config.browser.height), (960, 960));
		assert_eq!(config.relay.port, 3001);
		assert_eq!(config.transcode.fps, 30);
		assert_eq!(config.transcode.keyframe_interval(), 60);
		assert_eq!(config.capture.sample_rate, 48_000);
		assert_eq!(config.restart.max_restarts, 10);
		assert_eq!(config.restart.initial_delay, Duration::from_secs(5));
		assert_eq!(config.restart.max_delay, Duration::from_secs(60));
		assert_eq!(config.restart.multiplier, 1.5);
	}

	#[test]
	fn missing_stream_key_is_rejected() {
		let err = StreamConfig::default().validate().unwrap_err();
		assert!(matches!(err, Error::Config(ref m) if m.contains("stream key")));

		let mut blank = valid();
		blank.transcode.stream_key = Some("  ".into());
		assert!(blank.validate().is_err());
	}

	#[test]
	fn bad_restart_policy_is_rejected() {
		let mut config = valid();
		config.restart.multiplier = 0.5;
		assert!(config.validate().is_err());

		let mut config = valid();
		config.restart.max_delay = Duration::from_secs(1);
		assert!(config.validate().is_err());

		let mut config = valid();
		config.restart.multiplier = f64::NAN;
		assert!(config.validate().is_err());

		let mut config = valid();
		config.restart.multiplier = f64::INFINITY;
		assert!(config.validate().is_err());
	}

	#[test]
	fn only_stereo_capture_is_accepted() {
		for channels in [0, 1, 6] {
			let mut config = valid();
			config.capture.channels = channels;
			let err = config.validate().unwrap_err();
			assert!(err.to_string().contains("capture.channels"), "{channels}: {err}");
		}
	}

	#[test]
	fn zero_dimensions_are_rejected() {
		let mut config = valid();
		config.transcode.fps = 0;
		let err = config.validate().unwrap_err();
		assert!(err.to_string().contains("transcode.fps"));
	}

	#[test]
	fn valid_config_passes() {
		valid().validate().unwrap();
	}

	#[test]
	fn partial_file_keeps_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{ "relay": {{ "port": 4000 }}, "restart": {{ "initial_delay": 250 }}, "transcode": {{ "stream_key": "k" }} }}"#
		)
		.unwrap();

		let config = StreamConfig::from_file(file.path()).unwrap();
		assert_eq!(config.relay.port, 4000);
		assert_eq!(config.relay.producer_timeout, Duration::from_secs(30));
		assert_eq!(config.restart.initial_delay, Duration::from_millis(250));
		assert_eq!(config.restart.max_restarts, 10);
		assert_eq!(config.transcode.stream_key.as_deref(), Some("k"));
	}

	#[test]
	fn malformed_file_is_a_config_error() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "{{ not json").unwrap();
		assert!(matches!(StreamConfig::from_file(file.path()), Err(Error::Config(_))));
	}

	#[test]
	fn redaction_hides_stream_key() {
		let config = valid().redacted();
		assert_eq!(config.transcode.stream_key.as_deref(), Some("****"));
		assert_eq!(
			redact("rtmp://live.twitch.tv/app/live_123_abc", Some("live_123_abc")),
			"rtmp://live.twitch.tv/app/****"
		);
		assert_eq!(redact("unchanged", None), "unchanged");
	}
}
