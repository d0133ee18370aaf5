//! ffmpeg child supervision.
//!
//! [`TranscodeSupervisor`] owns one ffmpeg process per attempt. WebM chunks
//! from the relay go to stdin, PCM from the audio tap goes to fd 3, and stderr
//! is classified line by line. Any exit that [`stop`](TranscodeSupervisor::stop)
//! did not ask for is raised as a fault; the process is never restarted in
//! place.

pub mod args;
pub mod diagnostics;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub use args::{AudioInput, TranscodeSettings, build_args};
pub use diagnostics::{Diagnostic, Progress, Severity};

use crate::error::{Error, Result};
use crate::fault::{Fault, FaultSender, spawn_supervised};
use crate::relay::MediaChunk;
use diagnostics::{LineSplitter, ProgressSampler, classify_line};

/// Upper bound on waiting for a writer to flush after its input is closed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Observer called with every classified stderr line.
pub type DiagnosticSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// One running ffmpeg process and the tasks feeding and watching it.
pub struct TranscodeSupervisor {
	pid: Option<u32>,
	audio: AudioInput,
	stop_grace: Duration,
	stopping: Arc<AtomicBool>,
	video_close: Option<oneshot::Sender<()>>,
	audio_close: Option<oneshot::Sender<()>>,
	kill: Option<oneshot::Sender<()>>,
	video_writer: Option<JoinHandle<()>>,
	audio_writer: Option<JoinHandle<()>>,
	stderr_reader: Option<JoinHandle<()>>,
	exit_watcher: Option<JoinHandle<()>>,
}

impl TranscodeSupervisor {
	pub async fn start(
		settings: TranscodeSettings,
		video: mpsc::Receiver<MediaChunk>,
		audio: Option<mpsc::Receiver<Bytes>>,
		faults: FaultSender,
	) -> Result<Self> {
		Self::start_with_sink(settings, video, audio, faults, None).await
	}

	/// Like [`start`](Self::start), also passing every diagnostic to `sink`.
	pub async fn start_with_sink(
		settings: TranscodeSettings,
		video: mpsc::Receiver<MediaChunk>,
		audio: Option<mpsc::Receiver<Bytes>>,
		faults: FaultSender,
		sink: Option<DiagnosticSink>,
	) -> Result<Self> {
		let audio = if cfg!(unix) {
			audio
		} else {
			if audio.is_some() {
				warn!(target = "pixelcast.transcode", "audio pipe unsupported on this platform, publishing silence");
			}
			None
		};
		let input = if audio.is_some() { AudioInput::Pipe } else { AudioInput::Silence };

		let mut command = Command::new(&settings.program);
		command
			.args(build_args(&settings, input))
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		#[cfg(unix)]
		let audio_pipe = match input {
			AudioInput::Pipe => Some(audio_fd::attach(&mut command).map_err(|source| Error::Spawn {
				program: settings.program.display().to_string(),
				source,
			})?),
			AudioInput::Silence => None,
		};

		info!(
			target = "pixelcast.transcode",
			command = %settings.redacted_command_line(input),
			"starting ffmpeg"
		);

		let mut child = command.spawn().map_err(|source| Error::Spawn {
			program: settings.program.display().to_string(),
			source,
		})?;

		let pid = child.id();
		let stopping = Arc::new(AtomicBool::new(false));

		let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
			return Err(Error::Spawn {
				program: settings.program.display().to_string(),
				source: std::io::Error::other("ffmpeg stdio was not captured"),
			});
		};

		let (video_close, video_close_rx) = oneshot::channel();
		let video_writer = spawn_supervised(
			"video-writer",
			faults.clone(),
			pump("video", video, stdin, video_close_rx, Arc::clone(&stopping), faults.clone()),
		);

		let mut audio_close = None;
		let mut audio_writer = None;
		#[cfg(unix)]
		if let (Some(frames), Some(pipe)) = (audio, audio_pipe) {
			let pipe = pipe.into_sender()?;
			let (close, close_rx) = oneshot::channel();
			audio_close = Some(close);
			audio_writer = Some(spawn_supervised(
				"audio-writer",
				faults.clone(),
				pump("audio", frames, pipe, close_rx, Arc::clone(&stopping), faults.clone()),
			));
		}

		let reader = DiagnosticReader {
			splitter: LineSplitter::default(),
			sampler: ProgressSampler::new(settings.progress_sample_every),
			sink,
			stopping: Arc::clone(&stopping),
			faults: faults.clone(),
			fatal_raised: false,
		};
		let stderr_reader = spawn_supervised("ffmpeg-stderr", faults.clone(), reader.run(stderr));

		let (kill, kill_rx) = oneshot::channel();
		let exit_watcher = spawn_supervised(
			"ffmpeg-exit",
			faults.clone(),
			watch_exit(child, kill_rx, Arc::clone(&stopping), faults),
		);

		info!(target = "pixelcast.transcode", pid, audio = ?input, "ffmpeg started");

		Ok(Self {
			pid,
			audio: input,
			stop_grace: settings.stop_grace,
			stopping,
			video_close: Some(video_close),
			audio_close,
			kill: Some(kill),
			video_writer: Some(video_writer),
			audio_writer,
			stderr_reader: Some(stderr_reader),
			exit_watcher: Some(exit_watcher),
		})
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	pub fn audio_input(&self) -> AudioInput {
		self.audio
	}

	pub fn is_running(&self) -> bool {
		self.exit_watcher.as_ref().is_some_and(|watcher| !watcher.is_finished())
	}

	/// Shuts ffmpeg down: video input, audio input, SIGTERM, grace, SIGKILL.
	///
	/// Idempotent. Nothing raised after this point is reported as a fault.
	pub async fn stop(&mut self) {
		let Some(mut watcher) = self.exit_watcher.take() else {
			return;
		};
		self.stopping.store(true, Ordering::Release);
		debug!(target = "pixelcast.transcode", pid = self.pid, "stopping ffmpeg");

		close_input(self.video_close.take(), self.video_writer.take()).await;
		close_input(self.audio_close.take(), self.audio_writer.take()).await;

		if !watcher.is_finished() {
			if let Some(pid) = self.pid {
				terminate(pid);
			}
		}

		if tokio::time::timeout(self.stop_grace, &mut watcher).await.is_err() {
			warn!(
				target = "pixelcast.transcode",
				pid = self.pid,
				grace_ms = self.stop_grace.as_millis() as u64,
				"ffmpeg ignored SIGTERM, killing"
			);
			if let Some(kill) = self.kill.take() {
				let _ = kill.send(());
			}
			let _ = watcher.await;
		}
		self.kill.take();

		if let Some(reader) = self.stderr_reader.take() {
			// A grandchild holding stderr open must not stall teardown.
			if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, reader).await.is_err() {
				debug!(target = "pixelcast.transcode", "stderr reader still busy after exit");
			}
		}
		info!(target = "pixelcast.transcode", pid = self.pid, "ffmpeg stopped");
	}
}

impl Drop for TranscodeSupervisor {
	fn drop(&mut self) {
		self.stopping.store(true, Ordering::Release);
		for task in [
			self.video_writer.take(),
			self.audio_writer.take(),
			self.stderr_reader.take(),
			self.exit_watcher.take(),
		]
		.into_iter()
		.flatten()
		{
			task.abort();
		}
	}
}

async fn close_input(close: Option<oneshot::Sender<()>>, writer: Option<JoinHandle<()>>) {
	if let Some(close) = close {
		let _ = close.send(());
	}
	if let Some(mut writer) = writer {
		if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
			writer.abort();
		}
	}
}

/// Copies one input channel into one ffmpeg pipe until closed.
async fn pump<T, W>(
	name: &'static str,
	mut input: mpsc::Receiver<T>,
	mut output: W,
	mut close: oneshot::Receiver<()>,
	stopping: Arc<AtomicBool>,
	faults: FaultSender,
) where
	T: AsRef<[u8]>,
	W: AsyncWrite + Unpin,
{
	let mut written: u64 = 0;
	loop {
		let item = tokio::select! {
			biased;
			_ = &mut close => break,
			item = input.recv() => item,
		};
		let Some(item) = item else {
			if !stopping.load(Ordering::Acquire) {
				warn!(target = "pixelcast.transcode", input = name, "input ended while streaming");
				faults.raise(Fault::InputClosed(name));
			}
			break;
		};
		let bytes = item.as_ref();
		if let Err(e) = output.write_all(bytes).await {
			if !stopping.load(Ordering::Acquire) {
				error!(target = "pixelcast.transcode", input = name, error = %e, "write to ffmpeg failed");
				faults.raise(Fault::TranscoderFatal(format!("{name} write failed: {e}")));
			}
			break;
		}
		written += bytes.len() as u64;
	}
	let _ = output.shutdown().await;
	debug!(target = "pixelcast.transcode", input = name, bytes = written, "input closed");
}

async fn watch_exit(mut child: Child, kill: oneshot::Receiver<()>, stopping: Arc<AtomicBool>, faults: FaultSender) {
	let status = tokio::select! {
		status = child.wait() => status,
		_ = kill => {
			if let Err(e) = child.start_kill() {
				debug!(target = "pixelcast.transcode", error = %e, "kill failed");
			}
			child.wait().await
		}
	};

	let code = match status {
		Ok(status) => {
			log_exit(status, stopping.load(Ordering::Acquire));
			status.code()
		}
		Err(e) => {
			warn!(target = "pixelcast.transcode", error = %e, "could not reap ffmpeg");
			None
		}
	};

	if !stopping.load(Ordering::Acquire) {
		faults.raise(Fault::TranscoderExited { code });
	}
}

fn log_exit(status: ExitStatus, requested: bool) {
	if requested {
		debug!(target = "pixelcast.transcode", %status, "ffmpeg exited");
	} else {
		error!(target = "pixelcast.transcode", %status, "ffmpeg exited unexpectedly");
	}
}

struct DiagnosticReader {
	splitter: LineSplitter,
	sampler: ProgressSampler,
	sink: Option<DiagnosticSink>,
	stopping: Arc<AtomicBool>,
	faults: FaultSender,
	fatal_raised: bool,
}

impl DiagnosticReader {
	async fn run<R: AsyncRead + Unpin>(mut self, mut stderr: R) {
		let mut buf = vec![0u8; 4096];
		loop {
			let n = match stderr.read(&mut buf).await {
				Ok(0) => break,
				Ok(n) => n,
				Err(e) => {
					debug!(target = "pixelcast.transcode", error = %e, "stderr read failed");
					break;
				}
			};
			for line in self.splitter.push(&buf[..n]) {
				self.handle(&line);
			}
		}
		if let Some(line) = self.splitter.finish() {
			self.handle(&line);
		}
	}

	fn handle(&mut self, line: &str) {
		let diagnostic = classify_line(line);
		match diagnostic.severity {
			Severity::Info => {
				if self.sampler.should_log() {
					match diagnostic.progress {
						Some(p) => info!(
							target = "pixelcast.transcode",
							frame = p.frame,
							fps = p.fps,
							bitrate_kbps = p.bitrate_kbps,
							speed = p.speed,
							"encoding"
						),
						None => info!(target = "pixelcast.transcode", line, "encoding"),
					}
				}
			}
			Severity::Warning => warn!(target = "pixelcast.transcode", line, "ffmpeg"),
			Severity::Fatal => {
				error!(target = "pixelcast.transcode", line, "ffmpeg fatal");
				if !self.fatal_raised && !self.stopping.load(Ordering::Acquire) {
					self.fatal_raised = true;
					self.faults.raise(Fault::TranscoderFatal(line.to_string()));
				}
			}
			Severity::Noise => trace!(target = "pixelcast.transcode", line, "ffmpeg"),
		}
		if let Some(sink) = &self.sink {
			sink(&diagnostic);
		}
	}
}

#[cfg(unix)]
fn terminate(pid: u32) {
	use nix::sys::signal::{self, Signal};
	use nix::unistd::Pid;

	if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
		debug!(target = "pixelcast.transcode", pid, error = %e, "SIGTERM failed");
	}
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Hands ffmpeg the read end of a pipe as fd 3.
#[cfg(unix)]
mod audio_fd {
	use std::io;
	use std::os::fd::{AsRawFd, OwnedFd, RawFd};

	use nix::fcntl::{FcntlArg, FdFlag, fcntl};
	use nix::unistd::{dup2, pipe};
	use tokio::net::unix::pipe::Sender;
	use tokio::process::Command;

	use super::args::AUDIO_FD;

	pub(super) struct AudioPipe {
		// Held until after spawn so the child can inherit it.
		_read: OwnedFd,
		write: OwnedFd,
	}

	impl AudioPipe {
		/// Call after spawn; drops the parent's read end.
		pub(super) fn into_sender(self) -> io::Result<Sender> {
			Sender::from_owned_fd(self.write)
		}
	}

	pub(super) fn attach(command: &mut Command) -> io::Result<AudioPipe> {
		let (read, write) = pipe()?;
		set_cloexec(read.as_raw_fd(), true)?;
		set_cloexec(write.as_raw_fd(), true)?;

		let raw = read.as_raw_fd();
		// SAFETY: the closure only calls dup2 and fcntl, both async-signal-safe.
		unsafe {
			command.pre_exec(move || {
				if raw == AUDIO_FD {
					set_cloexec(raw, false)
				} else {
					dup2(raw, AUDIO_FD).map(drop).map_err(io::Error::from)
				}
			});
		}

		Ok(AudioPipe { _read: read, write })
	}

	fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
		let flags = if on { FdFlag::FD_CLOEXEC } else { FdFlag::empty() };
		fcntl(fd, FcntlArg::F_SETFD(flags)).map(drop).map_err(io::Error::from)
	}
}
