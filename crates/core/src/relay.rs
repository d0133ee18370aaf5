//! Loopback WebSocket relay between the in-page recorder and ffmpeg.
//!
//! One binary message is one [`MediaChunk`]. Chunks go out in arrival order
//! through a bounded channel whose receiver becomes ffmpeg's video input; the
//! socket is not read again until the chunk has been queued, so a slow encoder
//! slows the producer down instead of growing a buffer.
//!
//! Only one producer may be connected. A concurrent upgrade is answered with
//! `409 Conflict`. When the producer goes away the output stays open for
//! `reconnect_timeout`; if nobody comes back by then the attempt's fault
//! channel gets [`Fault::ProducerLost`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSession, Signal};
use crate::config::{RelayConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultSender};

/// Chunks buffered between the socket and ffmpeg's stdin.
pub const VIDEO_CHANNEL_CAPACITY: usize = 64;

const PROGRESS_EVERY: u64 = 100;
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const RECORDER_SCRIPT: &str = include_str!("../js/recorder.js");

/// One recorder chunk, numbered on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
	pub seq: u64,
	pub data: Bytes,
}

impl AsRef<[u8]> for MediaChunk {
	fn as_ref(&self) -> &[u8] {
		&self.data
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
	pub chunks: u64,
	pub bytes: u64,
}

impl RelayStats {
	pub fn megabytes(&self) -> f64 {
		self.bytes as f64 / (1024.0 * 1024.0)
	}
}

struct Shared {
	output: Mutex<Option<mpsc::Sender<MediaChunk>>>,
	connected: watch::Sender<bool>,
	closing: watch::Sender<bool>,
	producer_slot: AtomicBool,
	/// Bumped on every accepted producer; a handler only clears `connected`
	/// for its own connection.
	generation: AtomicU64,
	next_seq: AtomicU64,
	chunks: AtomicU64,
	bytes: AtomicU64,
	max_payload: usize,
	reconnect_timeout: Duration,
	faults: FaultSender,
}

impl Shared {
	fn new(config: &RelayConfig, output: mpsc::Sender<MediaChunk>, faults: FaultSender) -> Self {
		Self {
			output: Mutex::new(Some(output)),
			connected: watch::Sender::new(false),
			closing: watch::Sender::new(false),
			producer_slot: AtomicBool::new(false),
			generation: AtomicU64::new(0),
			next_seq: AtomicU64::new(0),
			chunks: AtomicU64::new(0),
			bytes: AtomicU64::new(0),
			max_payload: config.max_payload,
			reconnect_timeout: config.reconnect_timeout,
			faults,
		}
	}

	/// Marks a new producer as connected and returns its generation.
	fn mark_connected(&self) -> u64 {
		let mut generation = 0;
		self.connected.send_modify(|up| {
			generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
			*up = true;
		});
		generation
	}

	/// Clears `connected` unless a newer producer has taken over.
	fn mark_disconnected(&self, generation: u64) -> bool {
		self.connected.send_if_modified(|up| {
			let current = self.generation.load(Ordering::SeqCst) == generation;
			if current {
				*up = false;
			}
			current
		})
	}

	fn stats(&self) -> RelayStats {
		RelayStats {
			chunks: self.chunks.load(Ordering::Relaxed),
			bytes: self.bytes.load(Ordering::Relaxed),
		}
	}
}

/// Releases the single producer slot when the connection ends.
struct ProducerSlot(Arc<Shared>);

impl Drop for ProducerSlot {
	fn drop(&mut self) {
		self.0.producer_slot.store(false, Ordering::Release);
	}
}

pub struct VideoRelay {
	addr: SocketAddr,
	shared: Arc<Shared>,
	output: Option<mpsc::Receiver<MediaChunk>>,
	shutdown: Option<oneshot::Sender<()>>,
	server: Option<JoinHandle<()>>,
}

impl VideoRelay {
	/// Starts listening on `127.0.0.1:port`. A producer that disconnects and
	/// stays away is reported on `faults`.
	pub async fn bind(config: &RelayConfig, faults: FaultSender) -> Result<Self> {
		let requested = SocketAddr::from(([127, 0, 0, 1], config.port));
		let listener = TcpListener::bind(requested)
			.await
			.map_err(|source| Error::Bind { addr: requested, source })?;
		let addr = listener.local_addr()?;

		let (tx, rx) = mpsc::channel(VIDEO_CHANNEL_CAPACITY);
		let shared = Arc::new(Shared::new(config, tx, faults));

		let app = Router::new().route("/", get(upgrade)).with_state(Arc::clone(&shared));
		let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
		let server = tokio::spawn(async move {
			let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
				let _ = shutdown_rx.await;
			});
			if let Err(e) = serve.await {
				warn!(target = "pixelcast.relay", error = %e, "relay server stopped with error");
			}
		});

		info!(target = "pixelcast.relay", %addr, "relay listening");
		Ok(Self {
			addr,
			shared,
			output: Some(rx),
			shutdown: Some(shutdown_tx),
			server: Some(server),
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	/// URL the in-page recorder connects to.
	pub fn url(&self) -> String {
		format!("ws://{}/", self.addr)
	}

	/// Hands out the ordered chunk stream. Only the first call returns it.
	pub fn take_output(&mut self) -> Option<mpsc::Receiver<MediaChunk>> {
		self.output.take()
	}

	pub fn is_connected(&self) -> bool {
		*self.shared.connected.borrow()
	}

	pub fn stats(&self) -> RelayStats {
		self.shared.stats()
	}

	/// Resolves once a producer is connected.
	pub async fn wait_for_producer(&self, timeout: Duration) -> Result<()> {
		let mut connected = self.shared.connected.subscribe();
		let wait = async { connected.wait_for(|up| *up).await.map(|_| ()) };
		match tokio::time::timeout(timeout, wait).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(_)) => Err(Error::Capture("relay closed while waiting for a producer".to_string())),
			Err(_) => Err(Error::timeout("a relay producer to connect", timeout)),
		}
	}

	/// Starts the in-page recorder once real content is on screen.
	pub async fn arm_recorder(&self, browser: &BrowserSession, config: &StreamConfig) -> Result<()> {
		let content = Signal::Selector(config.browser.content_selector.clone());
		browser.wait_for_content(&content, config.browser.content_timeout).await;

		let report: RecorderReport = serde_json::from_value(browser.evaluate(&self.recorder_expression(config)).await?)
			.map_err(|e| Error::Capture(format!("unexpected recorder result: {e}")))?;
		if !report.ok {
			return Err(Error::Capture(
				report.reason.unwrap_or_else(|| "recorder failed to start".to_string()),
			));
		}

		info!(
			target = "pixelcast.relay",
			mime_type = report.mime_type.as_deref().unwrap_or("unknown"),
			fps = config.capture.capture_fps,
			"in-page recorder started"
		);
		Ok(())
	}

	fn recorder_expression(&self, config: &StreamConfig) -> String {
		let capture = &config.capture;
		let options = json!({
			"url": self.url(),
			"canvasId": capture.canvas_id,
			"fps": capture.capture_fps,
			"mimeTypes": capture.mime_types,
			"timesliceMs": capture.timeslice_ms,
			"videoBitsPerSecond": capture.recorder_bits_per_second,
		});
		format!("({})({options})", RECORDER_SCRIPT.trim())
	}

	/// Stops accepting, drops the producer and ends the chunk stream.
	/// Safe to call repeatedly.
	pub async fn close(&mut self) {
		let Some(server) = self.server.take() else {
			return;
		};

		self.shared.closing.send_replace(true);
		self.shared.output.lock().take();
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}

		let abort = server.abort_handle();
		if tokio::time::timeout(SERVER_STOP_TIMEOUT, server).await.is_err() {
			debug!(target = "pixelcast.relay", "relay server slow to stop, aborting");
			abort.abort();
		}

		let stats = self.shared.stats();
		info!(target = "pixelcast.relay", chunks = stats.chunks, bytes = stats.bytes, "relay closed");
	}
}

impl Drop for VideoRelay {
	fn drop(&mut self) {
		self.shared.closing.send_replace(true);
		if let Some(server) = self.server.take() {
			server.abort();
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecorderReport {
	ok: bool,
	#[serde(default)]
	mime_type: Option<String>,
	#[serde(default)]
	reason: Option<String>,
}

async fn upgrade(ws: WebSocketUpgrade, State(shared): State<Arc<Shared>>) -> Response {
	if *shared.closing.borrow() {
		return (StatusCode::SERVICE_UNAVAILABLE, "relay closing").into_response();
	}
	if shared.producer_slot.swap(true, Ordering::AcqRel) {
		warn!(target = "pixelcast.relay", "refusing concurrent producer");
		return (StatusCode::CONFLICT, "a producer is already connected").into_response();
	}

	let slot = ProducerSlot(Arc::clone(&shared));
	ws.max_message_size(shared.max_payload)
		.on_upgrade(move |socket| handle_producer(socket, slot))
}

async fn handle_producer(mut socket: WebSocket, slot: ProducerSlot) {
	let shared = Arc::clone(&slot.0);
	let mut closing = shared.closing.subscribe();
	if *closing.borrow() {
		return;
	}
	let Some(output) = shared.output.lock().clone() else {
		return;
	};

	let generation = shared.mark_connected();
	info!(target = "pixelcast.relay", generation, "producer connected");

	loop {
		let message = tokio::select! {
			message = socket.recv() => message,
			_ = closing.changed() => break,
		};

		match message {
			Some(Ok(Message::Binary(data))) => {
				let len = data.len() as u64;
				let chunk = MediaChunk {
					seq: shared.next_seq.fetch_add(1, Ordering::SeqCst),
					data,
				};
				let queued = tokio::select! {
					queued = output.send(chunk) => queued.is_ok(),
					_ = closing.changed() => false,
				};
				if !queued {
					debug!(target = "pixelcast.relay", "video output closed, dropping producer");
					break;
				}

				let chunks = shared.chunks.fetch_add(1, Ordering::Relaxed) + 1;
				shared.bytes.fetch_add(len, Ordering::Relaxed);
				if chunks % PROGRESS_EVERY == 0 {
					let stats = shared.stats();
					info!(
						target = "pixelcast.relay",
						chunks,
						megabytes = format_args!("{:.2}", stats.megabytes()),
						"video chunks relayed"
					);
				}
			}
			Some(Ok(Message::Text(text))) => {
				info!(target = "pixelcast.relay", status = %text.as_str(), "producer status");
			}
			Some(Ok(Message::Close(_))) | None => break,
			Some(Ok(_)) => {}
			Some(Err(e)) => {
				warn!(target = "pixelcast.relay", error = %e, "producer socket error");
				break;
			}
		}
	}

	drop(slot);
	if !shared.mark_disconnected(generation) || *shared.closing.borrow() {
		return;
	}
	info!(
		target = "pixelcast.relay",
		timeout_ms = shared.reconnect_timeout.as_millis() as u64,
		"producer disconnected, waiting for it to reconnect"
	);
	await_reconnect(&shared).await;
}

/// Raises [`Fault::ProducerLost`] unless a producer is back within the
/// reconnect window or the relay closes first.
async fn await_reconnect(shared: &Shared) {
	let window = shared.reconnect_timeout;
	let mut connected = shared.connected.subscribe();
	let mut closing = shared.closing.subscribe();
	let returned = tokio::time::timeout(window, async move { connected.wait_for(|up| *up).await.map(|_| ()) });

	tokio::select! {
		returned = returned => {
			if returned.is_err() {
				warn!(target = "pixelcast.relay", timeout_ms = window.as_millis() as u64, "producer did not reconnect");
				shared.faults.raise(Fault::ProducerLost(window));
			}
		}
		_ = closing.wait_for(|shut| *shut) => {}
	}
}
