//! Chromium launch with remote debugging.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use pixelcast_protocol::VersionInfo;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::finder::find_chrome_executable;
use crate::probe::fetch_version;
use crate::process::free_local_port;

const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// How to start the browser.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
	/// Explicit binary; discovery runs when unset.
	pub executable: Option<PathBuf>,
	pub headless: bool,
	/// Window size in CSS pixels.
	pub window_size: (u32, u32),
	/// Appended after the built-in flags.
	pub extra_args: Vec<String>,
	/// Upper bound for the DevTools endpoint to come up.
	pub startup_timeout: Duration,
	/// Fixed debugging port; a free port is picked when unset.
	pub port: Option<u16>,
}

impl Default for LaunchOptions {
	fn default() -> Self {
		Self {
			executable: None,
			headless: true,
			window_size: (960, 960),
			extra_args: Vec::new(),
			startup_timeout: Duration::from_secs(15),
			port: None,
		}
	}
}

impl LaunchOptions {
	/// Full flag list passed to the browser, minus the port and profile.
	pub fn browser_flags(&self) -> Vec<String> {
		let (width, height) = self.window_size;
		let mut args = Vec::new();
		if self.headless {
			args.push("--headless=new".to_string());
		}
		args.extend(
			[
				"--disable-gpu",
				"--disable-audio-output",
				"--autoplay-policy=no-user-gesture-required",
				"--force-device-scale-factor=1",
				"--disable-lcd-text",
				"--no-sandbox",
				"--disable-dev-shm-usage",
				"--no-first-run",
				"--no-default-browser-check",
			]
			.map(str::to_string),
		);
		args.push(format!("--window-size={width},{height}"));
		args.extend(self.extra_args.iter().cloned());
		args
	}
}

/// A running browser with its DevTools endpoint resolved.
///
/// The child is killed when this value is dropped, and the temporary profile
/// directory is removed with it.
pub struct BrowserProcess {
	child: Child,
	port: u16,
	version: VersionInfo,
	_profile: TempDir,
}

impl BrowserProcess {
	pub async fn launch(options: &LaunchOptions) -> Result<Self> {
		let executable = find_chrome_executable(options.executable.as_deref()).ok_or_else(|| {
			Error::Launch(match &options.executable {
				Some(path) => format!("browser executable not found at {}", path.display()),
				None => "could not find a Chrome/Chromium executable; set one explicitly".to_string(),
			})
		})?;

		let port = match options.port {
			Some(port) => port,
			None => free_local_port()?,
		};
		let profile = tempfile::Builder::new().prefix("pixelcast-profile-").tempdir()?;

		let mut cmd = Command::new(&executable);
		cmd.arg(format!("--remote-debugging-port={port}"))
			.arg(format!("--user-data-dir={}", profile.path().display()))
			.args(options.browser_flags())
			.arg("about:blank")
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true);

		#[cfg(unix)]
		cmd.process_group(0);

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::Launch(format!("failed to start {}: {e}", executable.display())))?;

		debug!(target = "pixelcast.browser", executable = %executable.display(), port, pid = child.id(), "browser spawned");

		let deadline = tokio::time::Instant::now() + options.startup_timeout;
		let mut last_error = "endpoint not reachable".to_string();
		loop {
			tokio::time::sleep(PROBE_INTERVAL).await;

			if let Some(status) = child.try_wait()? {
				return Err(Error::Launch(format!(
					"browser exited before the debugging endpoint came up (status: {status})"
				)));
			}

			match fetch_version(port).await {
				Ok(version) => {
					info!(
						target = "pixelcast.browser",
						port,
						browser = version.browser.as_deref().unwrap_or("unknown"),
						"devtools endpoint ready"
					);
					return Ok(Self {
						child,
						port,
						version,
						_profile: profile,
					});
				}
				Err(e) => last_error = e.to_string(),
			}

			if tokio::time::Instant::now() >= deadline {
				let _ = child.start_kill();
				let _ = child.wait().await;
				return Err(Error::Launch(format!(
					"debugging endpoint not available on port {port} after {}ms: {last_error}",
					options.startup_timeout.as_millis()
				)));
			}
		}
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn pid(&self) -> Option<u32> {
		self.child.id()
	}

	/// Browser-level DevTools WebSocket URL.
	pub fn ws_url(&self) -> &str {
		&self.version.web_socket_debugger_url
	}

	pub fn version(&self) -> &VersionInfo {
		&self.version
	}

	/// Resolves when the browser process exits on its own.
	pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
		Ok(self.child.wait().await?)
	}

	/// Returns the exit status if the process has already ended.
	pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
		Ok(self.child.try_wait()?)
	}

	/// Kills and reaps the browser. Safe to call after it exited.
	pub async fn kill(&mut self) -> Result<()> {
		if self.child.try_wait()?.is_some() {
			return Ok(());
		}
		let _ = self.child.start_kill();
		self.child.wait().await?;
		Ok(())
	}
}
