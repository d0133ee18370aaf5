//! Classification of ffmpeg's stderr.
//!
//! ffmpeg runs with `-loglevel level+info`, so most lines carry a `[level]`
//! tag. Lines without one fall back to keyword matching.

use std::sync::LazyLock;

use regex::Regex;

/// Substrings that mean the encoder cannot continue.
const FATAL_MARKERS: &[&str] = &[
	"Conversion failed!",
	"Error opening output",
	"Error opening input",
	"Connection refused",
	"Broken pipe",
	"Input/output error",
	"Could not write header",
	"Exiting normally, received signal",
];

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("FRAME_RE should compile"));
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*([\d.]+)").expect("FPS_RE should compile"));
static BITRATE_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"bitrate=\s*([\d.]+)kbits/s").expect("BITRATE_RE should compile"));
static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("SPEED_RE should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
	/// Progress; logged sampled.
	Info,
	/// Codec or sync complaints.
	Warning,
	/// The encoder is going down or already has.
	Fatal,
	/// Banner, stream mapping, anything else.
	Noise,
}

/// Parsed `frame= ... fps= ... bitrate= ...` status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
	pub frame: u64,
	pub fps: Option<f64>,
	pub bitrate_kbps: Option<f64>,
	pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
	pub severity: Severity,
	pub line: String,
	pub progress: Option<Progress>,
}

pub fn classify_line(line: &str) -> Diagnostic {
	let line = line.trim();
	let lower = line.to_ascii_lowercase();

	let severity = if lower.contains("[fatal]")
		|| lower.contains("[panic]")
		|| FATAL_MARKERS.iter().any(|marker| line.contains(marker))
	{
		Severity::Fatal
	} else if line.contains("frame=") && FRAME_RE.is_match(line) {
		Severity::Info
	} else if lower.contains("[warning]")
		|| lower.contains("[error]")
		|| lower.contains("warning")
		|| lower.contains("error")
	{
		Severity::Warning
	} else {
		Severity::Noise
	};

	let progress = (severity == Severity::Info).then(|| parse_progress(line)).flatten();

	Diagnostic {
		severity,
		line: line.to_string(),
		progress,
	}
}

pub fn parse_progress(line: &str) -> Option<Progress> {
	let capture = |re: &Regex| re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str());
	Some(Progress {
		frame: capture(&FRAME_RE)?.parse().ok()?,
		fps: capture(&FPS_RE).and_then(|v| v.parse().ok()),
		bitrate_kbps: capture(&BITRATE_RE).and_then(|v| v.parse().ok()),
		speed: capture(&SPEED_RE).and_then(|v| v.parse().ok()),
	})
}

/// Splits a byte stream into lines on `\n` and `\r`.
///
/// Progress updates end in a bare carriage return, so splitting on newlines
/// alone would glue them together.
#[derive(Debug, Default)]
pub struct LineSplitter {
	pending: Vec<u8>,
}

impl LineSplitter {
	pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
		let mut lines = Vec::new();
		for &byte in bytes {
			if byte == b'\n' || byte == b'\r' {
				self.flush_into(&mut lines);
			} else {
				self.pending.push(byte);
			}
		}
		lines
	}

	/// Returns whatever is left once the stream has ended.
	pub fn finish(&mut self) -> Option<String> {
		let mut lines = Vec::new();
		self.flush_into(&mut lines);
		lines.pop()
	}

	fn flush_into(&mut self, lines: &mut Vec<String>) {
		if self.pending.is_empty() {
			return;
		}
		let line = String::from_utf8_lossy(&self.pending).trim().to_string();
		self.pending.clear();
		if !line.is_empty() {
			lines.push(line);
		}
	}
}

/// Passes one in `every` progress lines.
#[derive(Debug)]
pub struct ProgressSampler {
	every: u32,
	seen: u64,
}

impl ProgressSampler {
	pub fn new(every: u32) -> Self {
		Self {
			every: every.max(1),
			seen: 0,
		}
	}

	pub fn should_log(&mut self) -> bool {
		self.seen += 1;
		self.seen % u64::from(self.every) == 1 || self.every == 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn progress_line_is_info_with_parsed_fields() {
		let diagnostic = classify_line(
			"[info] frame=  912 fps= 30 q=23.0 size=    4096kB time=00:00:30.40 bitrate=2480.3kbits/s speed=1.01x",
		);
		assert_eq!(diagnostic.severity, Severity::Info);
		let progress = diagnostic.progress.unwrap();
		assert_eq!(progress.frame, 912);
		assert_eq!(progress.fps, Some(30.0));
		assert_eq!(progress.bitrate_kbps, Some(2480.3));
		assert_eq!(progress.speed, Some(1.01));
	}

	#[test]
	fn level_tags_drive_severity() {
		assert_eq!(
			classify_line("[flv @ 0x55d] [warning] Failed to update header with correct duration.").severity,
			Severity::Warning
		);
		assert_eq!(
			classify_line("[h264 @ 0x7f] [error] non-existing PPS 0 referenced").severity,
			Severity::Warning
		);
		assert_eq!(classify_line("[fatal] Invalid argument").severity, Severity::Fatal);
		assert_eq!(
			classify_line("[info] Stream mapping:").severity,
			Severity::Noise
		);
	}

	#[test]
	fn fatal_markers_win_over_error_level() {
		for line in [
			"[tcp @ 0x1] [error] Connection to tcp://live.twitch.tv:1935 failed: Connection refused",
			"[error] Error opening output rtmp://live.twitch.tv/app/****: I/O error",
			"[fatal] Conversion failed!",
			"av_interleaved_write_frame(): Broken pipe",
			"[error] Error writing trailer of rtmp://x: Input/output error",
		] {
			assert_eq!(classify_line(line).severity, Severity::Fatal, "{line}");
		}
	}

	#[test]
	fn untagged_lines_fall_back_to_keywords() {
		assert_eq!(classify_line("Past duration 0.6 too large - Warning").severity, Severity::Warning);
		assert_eq!(classify_line("Input #0, matroska,webm, from 'pipe:0':").severity, Severity::Noise);
	}

	#[test]
	fn splitter_breaks_on_carriage_returns() {
		let mut splitter = LineSplitter::default();
		let lines = splitter.push(b"frame=  1 fps=0.0\rframe=  2 fps=0.0\r[info] Stream ma");
		assert_eq!(lines, vec!["frame=  1 fps=0.0", "frame=  2 fps=0.0"]);

		let lines = splitter.push(b"pping:\r\n\r\n  Stream #0:0 -> #0:0\n");
		assert_eq!(lines, vec!["[info] Stream mapping:", "Stream #0:0 -> #0:0"]);
		assert_eq!(splitter.finish(), None);

		splitter.push(b"trailing");
		assert_eq!(splitter.finish().as_deref(), Some("trailing"));
	}

	#[test]
	fn sampler_passes_first_and_every_nth() {
		let mut sampler = ProgressSampler::new(3);
		let passed: Vec<bool> = (0..7).map(|_| sampler.should_log()).collect();
		assert_eq!(passed, vec![true, false, false, true, false, false, true]);

		let mut every = ProgressSampler::new(1);
		assert!(every.should_log() && every.should_log());
	}
}
