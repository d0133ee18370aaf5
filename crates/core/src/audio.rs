//! PCM tap on the page's Web Audio graph.
//!
//! The page registers its output nodes through
//! `window.pixelcast.registerAudioSource(node)`; the tap mixes them into a
//! capture node whose processor ships interleaved s16le blocks back through a
//! DevTools binding. Installation never fails the pipeline: anything that goes
//! wrong leaves audio [`Disabled`](AudioCapture::Disabled) and ffmpeg
//! synthesizes silence instead.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use pixelcast_protocol::{BindingCalled, Event};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, Signal};
use crate::config::CaptureConfig;
use crate::error::{Error, Result};

/// Name of the page -> host callback carrying PCM blocks.
pub const AUDIO_BINDING: &str = "pixelcastAudioFrame";

/// The tap always delivers interleaved stereo.
pub const AUDIO_CHANNELS: u16 = 2;

/// Bytes in one interleaved s16le stereo frame.
const BYTES_PER_FRAME: usize = 2 * AUDIO_CHANNELS as usize;

/// Frames per processor callback; about 43 ms at 48 kHz.
pub const FRAMES_PER_BLOCK: u32 = 2048;

/// PCM blocks buffered between the DevTools event task and ffmpeg.
pub const AUDIO_CHANNEL_CAPACITY: usize = 128;

const TAP_SCRIPT: &str = include_str!("../js/audio_tap.js");

pub enum AudioCapture {
	Enabled(AudioStream),
	Disabled,
}

impl AudioCapture {
	pub fn is_enabled(&self) -> bool {
		matches!(self, AudioCapture::Enabled(_))
	}
}

/// Live PCM from the page.
pub struct AudioStream {
	/// Interleaved s16le blocks in production order.
	pub frames: mpsc::Receiver<Bytes>,
	/// Task moving binding calls into `frames`; abort it on teardown.
	pub forwarder: JoinHandle<()>,
	/// Rate reported by the page's `AudioContext`.
	pub sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TapReport {
	ok: bool,
	#[serde(default)]
	sample_rate: Option<f64>,
	#[serde(default)]
	reason: Option<String>,
}

pub struct AudioTap;

impl AudioTap {
	/// Installs the tap, degrading to [`AudioCapture::Disabled`] on any failure.
	pub async fn install(browser: &BrowserSession, config: &CaptureConfig) -> AudioCapture {
		if !config.audio_enabled {
			info!(target = "pixelcast.audio", "audio capture disabled, publishing silence");
			return AudioCapture::Disabled;
		}

		match try_install(browser, config).await {
			Ok(stream) => {
				info!(
					target = "pixelcast.audio",
					sample_rate = stream.sample_rate,
					"audio tap installed"
				);
				AudioCapture::Enabled(stream)
			}
			Err(e) => {
				warn!(target = "pixelcast.audio", error = %e, "audio tap unavailable, publishing silence");
				AudioCapture::Disabled
			}
		}
	}
}

async fn try_install(browser: &BrowserSession, config: &CaptureConfig) -> Result<AudioStream> {
	browser.add_binding(AUDIO_BINDING).await?;
	let events = browser.subscribe();

	browser
		.wait_for_signal(&Signal::Predicate(graph_probe(&config.audio_graph)), config.audio_timeout)
		.await?;

	let report: TapReport = serde_json::from_value(browser.evaluate(&install_expression(config)).await?)
		.map_err(|e| Error::Capture(format!("unexpected tap result: {e}")))?;
	if !report.ok {
		return Err(Error::Capture(
			report.reason.unwrap_or_else(|| "tap refused to install".to_string()),
		));
	}

	let sample_rate = report.sample_rate.map(|rate| rate as u32);
	if let Some(rate) = sample_rate.filter(|rate| *rate != config.sample_rate) {
		warn!(
			target = "pixelcast.audio",
			page_rate = rate,
			configured = config.sample_rate,
			"page sample rate differs from the configured rate; audio pitch will be off"
		);
	}

	let (tx, frames) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
	let forwarder = tokio::spawn(forward_frames(events, browser.session_id().to_string(), tx));

	Ok(AudioStream {
		frames,
		forwarder,
		sample_rate,
	})
}

/// Truthy once the graph expression yields something we can tap.
fn graph_probe(graph: &str) -> String {
	format!(
		"(() => {{ try {{ const g = ({graph}); return !!g && typeof g.createScriptProcessor === 'function'; }} catch (_) {{ return false; }} }})()"
	)
}

fn install_expression(config: &CaptureConfig) -> String {
	let options = json!({ "binding": AUDIO_BINDING, "frames": FRAMES_PER_BLOCK });
	format!("({})(() => ({}), {options})", TAP_SCRIPT.trim(), config.audio_graph)
}

async fn forward_frames(mut events: broadcast::Receiver<Event>, session_id: String, tx: mpsc::Sender<Bytes>) {
	let mut blocks: u64 = 0;
	loop {
		let event = match events.recv().await {
			Ok(event) => event,
			Err(RecvError::Lagged(skipped)) => {
				warn!(target = "pixelcast.audio", skipped, "devtools events dropped; audio has a gap");
				continue;
			}
			Err(RecvError::Closed) => break,
		};

		if event.method != "Runtime.bindingCalled" || event.session_id.as_deref() != Some(session_id.as_str()) {
			continue;
		}
		let Some(pcm) = decode_binding(event) else {
			continue;
		};

		if tx.send(pcm).await.is_err() {
			debug!(target = "pixelcast.audio", "audio consumer gone");
			break;
		}
		blocks += 1;
	}
	debug!(target = "pixelcast.audio", blocks, "audio forwarder finished");
}

fn decode_binding(event: Event) -> Option<Bytes> {
	let called: BindingCalled = serde_json::from_value(event.params).ok()?;
	if called.name != AUDIO_BINDING {
		return None;
	}
	match STANDARD.decode(called.payload.as_bytes()) {
		Ok(pcm) if pcm.len() % BYTES_PER_FRAME == 0 => Some(Bytes::from(pcm)),
		Ok(pcm) => {
			debug!(target = "pixelcast.audio", len = pcm.len(), "dropping misaligned PCM block");
			None
		}
		Err(e) => {
			debug!(target = "pixelcast.audio", error = %e, "dropping undecodable PCM block");
			None
		}
	}
}

/// Clamps, scales and interleaves two float channels into s16le bytes.
///
/// Matches what the in-page processor produces, so the two stay in lockstep.
pub fn quantize_interleaved(left: &[f32], right: &[f32]) -> Vec<u8> {
	let mut out = Vec::with_capacity(left.len().min(right.len()) * BYTES_PER_FRAME);
	for (l, r) in left.iter().zip(right) {
		out.extend_from_slice(&quantize(*l).to_le_bytes());
		out.extend_from_slice(&quantize(*r).to_le_bytes());
	}
	out
}

fn quantize(sample: f32) -> i16 {
	if sample.is_nan() {
		return 0;
	}
	(sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use pixelcast_runtime::Connection;
	use pixelcast_runtime::fake_transport::{FakeTransportBuilder, FakeTransportController};
	use serde_json::Value;

	use super::*;

	fn page<F>(respond: F) -> (BrowserSession, FakeTransportController)
	where
		F: Fn(&Value) -> Value + Send + Sync + 'static,
	{
		let (parts, controller) = FakeTransportBuilder::new().respond_with(respond).build();
		let browser = BrowserSession::from_connection(Connection::new(parts), "T1", "S1", Duration::from_millis(100));
		(browser, controller)
	}

	fn evaluated(value: Value) -> Value {
		json!({ "result": { "result": { "type": "object", "value": value } } })
	}

	fn is_install(sent: &Value) -> bool {
		sent["params"]["expression"].as_str().is_some_and(|e| e.contains(AUDIO_BINDING))
	}

	/// Page whose graph shows up at once and whose tap script answers `report`.
	fn page_with_graph(report: Value) -> (BrowserSession, FakeTransportController) {
		page(move |sent| match sent["method"].as_str() {
			Some("Runtime.evaluate") if is_install(sent) => evaluated(report.clone()),
			Some("Runtime.evaluate") => evaluated(json!(true)),
			_ => json!({ "result": {} }),
		})
	}

	fn binding_event(name: &str, payload: &str) -> Event {
		Event {
			method: "Runtime.bindingCalled".to_string(),
			params: json!({ "name": name, "payload": payload, "executionContextId": 1 }),
			session_id: Some("S1".to_string()),
		}
	}

	#[test]
	fn quantize_clamps_and_interleaves() {
		let pcm = quantize_interleaved(&[0.0, 1.0, -2.0], &[0.5, -1.0, 2.0]);
		let samples: Vec<i16> = pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
		assert_eq!(samples, vec![0, 16383, 32767, -32767, -32767, 32767]);
	}

	#[test]
	fn quantize_truncates_toward_zero_like_int16array() {
		let pcm = quantize_interleaved(&[-0.00002], &[0.00002]);
		assert_eq!(pcm, vec![0, 0, 0, 0]);
	}

	#[test]
	fn quantize_stops_at_shorter_channel() {
		assert_eq!(quantize_interleaved(&[0.1, 0.2], &[0.1]).len(), 4);
		assert_eq!(quantize(f32::NAN), 0);
	}

	#[test]
	fn binding_payload_is_decoded() {
		let pcm = quantize_interleaved(&[0.25, -0.25], &[0.5, -0.5]);
		let event = binding_event(AUDIO_BINDING, &STANDARD.encode(&pcm));
		assert_eq!(decode_binding(event).unwrap(), Bytes::from(pcm));
	}

	#[test]
	fn foreign_or_malformed_bindings_are_dropped() {
		assert!(decode_binding(binding_event("somethingElse", "AAAA")).is_none());
		assert!(decode_binding(binding_event(AUDIO_BINDING, "not base64!")).is_none());
		assert!(decode_binding(binding_event(AUDIO_BINDING, &STANDARD.encode([1u8, 2, 3]))).is_none());
	}

	#[test]
	fn install_expression_embeds_graph_and_options() {
		let config = CaptureConfig {
			audio_graph: "window.game.audio".into(),
			..CaptureConfig::default()
		};
		let expression = install_expression(&config);
		assert!(expression.contains("registerAudioSource"));
		assert!(expression.contains("() => (window.game.audio)"));
		assert!(expression.contains(AUDIO_BINDING));
		assert!(expression.ends_with(&format!(
			"{})",
			json!({ "binding": AUDIO_BINDING, "frames": FRAMES_PER_BLOCK })
		)));
	}

	#[test]
	fn graph_probe_guards_reference_errors() {
		let probe = graph_probe("audioContext");
		assert!(probe.contains("try"));
		assert!(probe.contains("(audioContext)"));
	}

	#[tokio::test]
	async fn forwarder_keeps_order_and_filters_sessions() {
		let (events_tx, events_rx) = broadcast::channel(16);
		let (tx, mut rx) = mpsc::channel(4);
		let task = tokio::spawn(forward_frames(events_rx, "S1".to_string(), tx));

		let first = STANDARD.encode([1u8, 0, 2, 0]);
		let second = STANDARD.encode([3u8, 0, 4, 0]);
		events_tx.send(binding_event(AUDIO_BINDING, &first)).unwrap();
		let mut foreign = binding_event(AUDIO_BINDING, &first);
		foreign.session_id = Some("S2".to_string());
		events_tx.send(foreign).unwrap();
		events_tx
			.send(Event {
				method: "Page.loadEventFired".into(),
				params: Value::Null,
				session_id: Some("S1".into()),
			})
			.unwrap();
		events_tx.send(binding_event(AUDIO_BINDING, &second)).unwrap();

		assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[1, 0, 2, 0]));
		assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(&[3, 0, 4, 0]));

		drop(events_tx);
		task.await.unwrap();
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn missing_audio_graph_degrades_to_silence_after_timeout() {
		let (browser, controller) = page(|sent| match sent["method"].as_str() {
			Some("Runtime.evaluate") => evaluated(json!(false)),
			_ => json!({ "result": {} }),
		});
		let config = CaptureConfig::default();

		let started = tokio::time::Instant::now();
		let capture = AudioTap::install(&browser, &config).await;
		assert!(!capture.is_enabled());
		assert!(started.elapsed() >= config.audio_timeout);

		let sent = controller.take_sent().await;
		assert_eq!(sent[0]["method"], "Runtime.addBinding");
		assert_eq!(sent[0]["params"]["name"], AUDIO_BINDING);
		assert!(sent.iter().skip(1).all(|m| m["method"] == "Runtime.evaluate"));
		assert!(!sent.iter().any(is_install), "tap must not be installed without a graph");
	}

	#[tokio::test(start_paused = true)]
	async fn binding_failure_degrades_without_polling() {
		let (browser, controller) = page(|sent| match sent["method"].as_str() {
			Some("Runtime.addBinding") => json!({ "error": { "code": -32000, "message": "no page" } }),
			_ => json!({ "result": {} }),
		});

		assert!(!AudioTap::install(&browser, &CaptureConfig::default()).await.is_enabled());
		let sent = controller.take_sent().await;
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0]["method"], "Runtime.addBinding");
	}

	#[tokio::test(start_paused = true)]
	async fn refused_tap_script_degrades_to_silence() {
		let (browser, _controller) = page_with_graph(json!({ "ok": false, "reason": "no destination" }));
		assert!(!AudioTap::install(&browser, &CaptureConfig::default()).await.is_enabled());
	}

	#[tokio::test(start_paused = true)]
	async fn disabled_audio_sends_nothing() {
		let (browser, controller) = page_with_graph(json!({ "ok": true }));
		let config = CaptureConfig {
			audio_enabled: false,
			..CaptureConfig::default()
		};
		assert!(!AudioTap::install(&browser, &config).await.is_enabled());
		assert!(controller.take_sent().await.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn installed_tap_forwards_page_blocks() {
		let (browser, controller) = page_with_graph(json!({ "ok": true, "sampleRate": 48000 }));

		let AudioCapture::Enabled(mut stream) = AudioTap::install(&browser, &CaptureConfig::default()).await else {
			panic!("tap should install once the graph exists");
		};
		assert_eq!(stream.sample_rate, Some(48_000));

		let pcm = quantize_interleaved(&[0.5, -0.5], &[0.25, -0.25]);
		controller.inject_event(
			"Runtime.bindingCalled",
			json!({ "name": AUDIO_BINDING, "payload": STANDARD.encode(&pcm), "executionContextId": 1 }),
			Some("S1"),
		);
		let block = tokio::time::timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap();
		assert_eq!(block.unwrap(), Bytes::from(pcm));
		stream.forwarder.abort();
	}
}
