use std::path::PathBuf;

use pixelcast::StreamConfig;
use pixelcast::transcode::{AudioInput, TranscodeSettings};
use pixelcast_runtime::find_chrome_executable;
use pixelcast_runtime::process::port_available;

struct Report {
	chrome: Option<PathBuf>,
	ffmpeg: Option<PathBuf>,
	relay_port: u16,
	relay_port_free: bool,
	command_line: String,
}

impl Report {
	fn gather(config: &StreamConfig) -> Self {
		let audio = if config.capture.audio_enabled { AudioInput::Pipe } else { AudioInput::Silence };
		Self {
			chrome: find_chrome_executable(config.browser.executable.as_deref()),
			ffmpeg: which::which(&config.transcode.ffmpeg).ok(),
			relay_port: config.relay.port,
			relay_port_free: config.relay.port == 0 || port_available(config.relay.port),
			command_line: TranscodeSettings::from_config(config).redacted_command_line(audio),
		}
	}

	fn is_ready(&self) -> bool {
		self.chrome.is_some() && self.ffmpeg.is_some() && self.relay_port_free
	}

	fn render(&self) -> String {
		let found = |path: &Option<PathBuf>| match path {
			Some(path) => path.display().to_string(),
			None => "NOT FOUND".to_string(),
		};
		let port = if self.relay_port_free { "free" } else { "IN USE" };
		format!(
			"browser: {}\nffmpeg:  {}\nrelay:   127.0.0.1:{} ({port})\ncommand: {}",
			found(&self.chrome),
			found(&self.ffmpeg),
			self.relay_port,
			self.command_line
		)
	}
}

pub fn execute(config: &StreamConfig) -> anyhow::Result<i32> {
	config.validate()?;
	let report = Report::gather(config);
	println!("{}", report.render());
	if !report.is_ready() {
		anyhow::bail!("environment is not ready to stream");
	}
	Ok(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> StreamConfig {
		let mut config = StreamConfig::default();
		config.transcode.stream_key = Some("live_secret".into());
		config.transcode.ffmpeg = PathBuf::from("/definitely/missing/ffmpeg");
		config.browser.executable = Some(PathBuf::from("/definitely/missing/chromium"));
		config
	}

	#[test]
	fn missing_executables_fail_the_check() {
		let report = Report::gather(&config());
		assert!(!report.is_ready());
		let text = report.render();
		assert!(text.contains("browser: NOT FOUND"));
		assert!(text.contains("ffmpeg:  NOT FOUND"));
		assert!(execute(&config()).is_err());
	}

	#[test]
	fn command_line_is_printed_without_the_key() {
		let text = Report::gather(&config()).render();
		assert!(text.contains("-f flv"));
		assert!(text.contains("pipe:3"));
		assert!(!text.contains("live_secret"));
	}

	#[test]
	fn busy_relay_port_is_reported() {
		let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let mut config = config();
		config.relay.port = holder.local_addr().unwrap().port();

		let report = Report::gather(&config);
		assert!(!report.relay_port_free);
		assert!(report.render().contains("(IN USE)"));
	}

	#[test]
	fn invalid_configuration_is_rejected_before_probing() {
		let mut config = config();
		config.transcode.stream_key = None;
		let err = execute(&config).unwrap_err();
		assert!(err.to_string().contains("stream key"));
	}
}
