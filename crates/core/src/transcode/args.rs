//! ffmpeg command line for WebM + PCM in, H.264/AAC FLV out.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{StreamConfig, redact};

/// File descriptor ffmpeg reads raw PCM from.
pub const AUDIO_FD: i32 = 3;

/// Where the audio track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioInput {
	/// Interleaved s16le on `pipe:3`.
	Pipe,
	/// Generated silence.
	Silence,
}

/// Everything the supervisor needs, flattened out of [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct TranscodeSettings {
	pub program: PathBuf,
	pub rtmp_server: String,
	pub stream_key: String,
	pub width: u32,
	pub height: u32,
	pub fps: u32,
	pub video_bitrate: String,
	pub max_bitrate: String,
	pub buffer_size: String,
	pub keyframe_interval: u32,
	pub audio_bitrate: String,
	pub sample_rate: u32,
	pub channels: u16,
	pub stop_grace: Duration,
	pub progress_sample_every: u32,
}

impl TranscodeSettings {
	pub fn from_config(config: &StreamConfig) -> Self {
		let transcode = &config.transcode;
		Self {
			program: transcode.ffmpeg.clone(),
			rtmp_server: transcode.rtmp_server.clone(),
			stream_key: transcode.stream_key.clone().unwrap_or_default(),
			width: transcode.width,
			height: transcode.height,
			fps: transcode.fps,
			video_bitrate: transcode.video_bitrate.clone(),
			max_bitrate: transcode.max_bitrate.clone(),
			buffer_size: transcode.buffer_size.clone(),
			keyframe_interval: transcode.keyframe_interval(),
			audio_bitrate: transcode.audio_bitrate.clone(),
			sample_rate: config.capture.sample_rate,
			channels: config.capture.channels,
			stop_grace: transcode.stop_grace,
			progress_sample_every: transcode.progress_sample_every.max(1),
		}
	}

	/// `{server}/{key}`.
	pub fn publish_url(&self) -> String {
		format!("{}/{}", self.rtmp_server.trim_end_matches('/'), self.stream_key)
	}

	/// Command line with the stream key masked, for logs.
	pub fn redacted_command_line(&self, audio: AudioInput) -> String {
		let mut line = self.program.display().to_string();
		for arg in build_args(self, audio) {
			line.push(' ');
			line.push_str(&arg);
		}
		redact(&line, Some(&self.stream_key))
	}
}

pub fn build_args(settings: &TranscodeSettings, audio: AudioInput) -> Vec<String> {
	let mut args: Vec<String> = Vec::with_capacity(96);
	let mut push = |values: &[&str]| args.extend(values.iter().map(|v| v.to_string()));

	push(&["-hide_banner", "-loglevel", "level+info"]);
	push(&["-f", "webm", "-i", "pipe:0"]);

	let rate = settings.sample_rate.to_string();
	let channels = settings.channels.to_string();
	match audio {
		AudioInput::Pipe => {
			let input = format!("pipe:{AUDIO_FD}");
			push(&["-f", "s16le", "-ar", &rate, "-ac", &channels, "-i", &input]);
		}
		AudioInput::Silence => {
			let layout = if settings.channels == 1 { "mono" } else { "stereo" };
			let source = format!("anullsrc=channel_layout={layout}:sample_rate={rate}");
			push(&["-f", "lavfi", "-i", &source]);
		}
	}

	let scale = format!("scale={}:{}:flags=neighbor", settings.width, settings.height);
	let keyframes = settings.keyframe_interval.to_string();
	let fps = settings.fps.to_string();
	push(&["-vf", &scale, "-sws_flags", "neighbor+full_chroma_int+accurate_rnd"]);
	push(&[
		"-c:v",
		"libx264",
		"-preset",
		"veryfast",
		"-tune",
		"zerolatency",
		"-b:v",
		&settings.video_bitrate,
		"-maxrate",
		&settings.max_bitrate,
		"-bufsize",
		&settings.buffer_size,
		"-g",
		&keyframes,
		"-keyint_min",
		&keyframes,
		"-pix_fmt",
		"yuv420p",
		"-r",
		&fps,
		"-profile:v",
		"main",
		"-level",
		"4.1",
	]);

	push(&["-c:a", "aac", "-b:a", &settings.audio_bitrate, "-ar", &rate, "-ac", &channels]);

	// `aresample=async` replaces the deprecated `-async`. No `-shortest`: an
	// input ending is the supervisor's call, not ffmpeg's.
	push(&[
		"-af",
		"aresample=async=1:min_hard_comp=0.100000:first_pts=0",
		"-vsync",
		"cfr",
		"-max_muxing_queue_size",
		"1024",
		"-fflags",
		"+genpts",
	]);

	let url = settings.publish_url();
	push(&[
		"-f",
		"flv",
		"-flvflags",
		"no_duration_filesize",
		"-reconnect",
		"1",
		"-reconnect_streamed",
		"1",
		"-reconnect_delay_max",
		"10",
		&url,
	]);

	args
}
