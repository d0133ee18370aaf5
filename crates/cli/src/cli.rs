use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pixelcast::StreamConfig;

#[derive(Parser, Debug)]
#[command(name = "pixelcast")]
#[command(about = "Publish a headless browser page to an RTMP ingest, restarting on failure")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v debug, -vv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// JSON configuration file; flags and environment override it
	#[arg(short, long, global = true, value_name = "FILE", env = "PIXELCAST_CONFIG")]
	pub config: Option<PathBuf>,

	#[command(flatten)]
	pub overrides: Overrides,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
	/// Run the supervised stream (default)
	Run,
	/// Validate configuration and locate the browser and ffmpeg
	Check,
	/// Print the effective configuration as JSON with secrets masked
	PrintConfig,
}

#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
	/// Stream key appended to the RTMP server URL (falls back to TWITCH_STREAM_KEY)
	#[arg(long, global = true, env = "STREAM_KEY", hide_env_values = true)]
	pub stream_key: Option<String>,

	/// RTMP ingest base URL (falls back to TWITCH_SERVER)
	#[arg(long, global = true, env = "RTMP_SERVER")]
	pub rtmp_server: Option<String>,

	/// Page to capture
	#[arg(long, global = true, env = "PIXELCAST_URL")]
	pub url: Option<String>,

	/// Loopback port the in-page recorder connects to
	#[arg(long, global = true, env = "PIXELCAST_RELAY_PORT")]
	pub relay_port: Option<u16>,

	/// ffmpeg binary
	#[arg(long, global = true, env = "PIXELCAST_FFMPEG", value_name = "PATH")]
	pub ffmpeg: Option<PathBuf>,

	/// Chromium binary; discovered when omitted
	#[arg(long, global = true, env = "PIXELCAST_CHROME", value_name = "PATH")]
	pub chrome: Option<PathBuf>,

	/// Show the browser window
	#[arg(long, global = true)]
	pub headed: bool,

	/// Publish silence instead of tapping page audio
	#[arg(long, global = true)]
	pub no_audio: bool,

	/// Restarts allowed before giving up
	#[arg(long, global = true)]
	pub max_restarts: Option<u32>,
}

impl Overrides {
	/// Applies flags, then the legacy `TWITCH_*` variables for anything still unset.
	pub fn apply(&self, config: &mut StreamConfig, legacy_env: impl Fn(&str) -> Option<String>) {
		let transcode = &mut config.transcode;
		if let Some(key) = self.stream_key.clone().or_else(|| legacy_env("TWITCH_STREAM_KEY")) {
			transcode.stream_key = Some(key);
		}
		if let Some(server) = self.rtmp_server.clone().or_else(|| legacy_env("TWITCH_SERVER")) {
			transcode.rtmp_server = server;
		}
		if let Some(ffmpeg) = &self.ffmpeg {
			transcode.ffmpeg = ffmpeg.clone();
		}

		if let Some(url) = &self.url {
			config.browser.url = url.clone();
		}
		if let Some(chrome) = &self.chrome {
			config.browser.executable = Some(chrome.clone());
		}
		if self.headed {
			config.browser.headless = false;
		}
		if let Some(port) = self.relay_port {
			config.relay.port = port;
		}
		if self.no_audio {
			config.capture.audio_enabled = false;
		}
		if let Some(max) = self.max_restarts {
			config.restart.max_restarts = max;
		}
	}
}

impl Cli {
	pub fn command(&self) -> Commands {
		self.command.unwrap_or(Commands::Run)
	}

	/// Defaults, then the config file, then flags and environment.
	pub fn load_config(&self) -> anyhow::Result<StreamConfig> {
		let mut config = match &self.config {
			Some(path) => load_file(path)?,
			None => StreamConfig::default(),
		};
		self.overrides.apply(&mut config, |name| std::env::var(name).ok());
		Ok(config)
	}
}

fn load_file(path: &Path) -> anyhow::Result<StreamConfig> {
	StreamConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn no_env(_: &str) -> Option<String> {
		None
	}

	#[test]
	fn run_is_the_default_command() {
		let cli = Cli::try_parse_from(["pixelcast"]).unwrap();
		assert_eq!(cli.command(), Commands::Run);

		let cli = Cli::try_parse_from(["pixelcast", "print-config", "-vv"]).unwrap();
		assert_eq!(cli.command(), Commands::PrintConfig);
		assert_eq!(cli.verbose, 2);
	}

	#[test]
	fn flags_override_defaults() {
		let cli = Cli::try_parse_from([
			"pixelcast",
			"check",
			"--stream-key",
			"live_abc",
			"--rtmp-server",
			"rtmp://ingest.example/app",
			"--relay-port",
			"4001",
			"--headed",
			"--no-audio",
			"--max-restarts",
			"2",
		])
		.unwrap();

		let mut config = StreamConfig::default();
		cli.overrides.apply(&mut config, no_env);
		assert_eq!(config.transcode.stream_key.as_deref(), Some("live_abc"));
		assert_eq!(config.transcode.rtmp_server, "rtmp://ingest.example/app");
		assert_eq!(config.relay.port, 4001);
		assert!(!config.browser.headless);
		assert!(!config.capture.audio_enabled);
		assert_eq!(config.restart.max_restarts, 2);
	}

	#[test]
	fn legacy_variables_fill_gaps_only() {
		let legacy = |name: &str| match name {
			"TWITCH_STREAM_KEY" => Some("legacy_key".to_string()),
			"TWITCH_SERVER" => Some("rtmp://legacy/app".to_string()),
			_ => None,
		};

		let mut config = StreamConfig::default();
		Overrides::default().apply(&mut config, legacy);
		assert_eq!(config.transcode.stream_key.as_deref(), Some("legacy_key"));
		assert_eq!(config.transcode.rtmp_server, "rtmp://legacy/app");

		let overrides = Overrides {
			stream_key: Some("explicit".into()),
			..Overrides::default()
		};
		let mut config = StreamConfig::default();
		overrides.apply(&mut config, legacy);
		assert_eq!(config.transcode.stream_key.as_deref(), Some("explicit"));
	}

	#[test]
	fn file_values_survive_unset_flags() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, r#"{{ "transcode": {{ "fps": 25, "stream_key": "from_file" }}, "relay": {{ "port": 0 }} }}"#).unwrap();

		let mut config = load_file(file.path()).unwrap();
		Overrides::default().apply(&mut config, no_env);
		assert_eq!(config.transcode.fps, 25);
		assert_eq!(config.transcode.stream_key.as_deref(), Some("from_file"));
		assert_eq!(config.relay.port, 0);
		assert_eq!(config.transcode.width, 960);
	}

	#[test]
	fn unreadable_file_names_the_path() {
		let err = load_file(Path::new("/definitely/missing/pixelcast.json")).unwrap_err();
		assert!(format!("{err:#}").contains("/definitely/missing/pixelcast.json"));
	}
}
