//! Headless Chromium owning the page we capture.
//!
//! [`BrowserSession`] wraps one browser process, one DevTools connection and one
//! attached page target. A watcher task turns renderer crashes, target
//! detaches, a dropped DevTools socket and unexpected process exits into
//! [`Fault`]s unless the session is being closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pixelcast_protocol::{
	AttachToTargetResult, ConsoleApiCalled, CreateTargetResult, DetachedFromTarget, EvaluateResult, Event,
	ExceptionThrown, NavigateResult, TargetCrashed,
};
use pixelcast_runtime::transport::WebSocketTransport;
use pixelcast_runtime::{BrowserProcess, Connection, LaunchOptions};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::{Error, Result};
use crate::fault::{Fault, FaultSender};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something to wait for in the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
	/// A CSS selector that must match at least one element.
	Selector(String),
	/// A JavaScript expression that must evaluate truthy.
	Predicate(String),
}

impl Signal {
	fn expression(&self) -> String {
		match self {
			Signal::Selector(css) => {
				let quoted = serde_json::to_string(css).unwrap_or_else(|_| "\"\"".to_string());
				format!("document.querySelector({quoted}) !== null")
			}
			Signal::Predicate(js) => format!("Boolean({js})"),
		}
	}

	fn describe(&self) -> String {
		match self {
			Signal::Selector(css) => format!("selector `{css}`"),
			Signal::Predicate(js) => format!("predicate `{js}`"),
		}
	}
}

pub struct BrowserSession {
	connection: Connection,
	session_id: String,
	target_id: String,
	pid: Option<u32>,
	poll_interval: Duration,
	closing: Arc<AtomicBool>,
	shutdown: Option<oneshot::Sender<()>>,
	watcher: Option<JoinHandle<()>>,
	message_loop: Option<JoinHandle<()>>,
}

impl BrowserSession {
	/// Starts Chromium, attaches to a fresh page and sizes its viewport.
	pub async fn launch(config: &BrowserConfig, faults: FaultSender) -> Result<Self> {
		let options = LaunchOptions {
			executable: config.executable.clone(),
			headless: config.headless,
			window_size: (config.width, config.height),
			extra_args: config.extra_args.clone(),
			startup_timeout: config.startup_timeout,
			port: None,
		};
		let mut process = BrowserProcess::launch(&options)
			.await
			.map_err(|e| Error::Launch(e.to_string()))?;
		let pid = process.pid();

		let (connection, message_loop, target_id, session_id, events) = match attach(&process, config).await {
			Ok(attached) => attached,
			Err(e) => {
				let _ = process.kill().await;
				return Err(Error::Launch(e.to_string()));
			}
		};

		let closing = Arc::new(AtomicBool::new(false));
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let watcher = tokio::spawn(watch_browser(WatchState {
			process,
			connection: connection.clone(),
			events,
			session_id: session_id.clone(),
			target_id: target_id.clone(),
			faults,
			closing: Arc::clone(&closing),
			shutdown: shutdown_rx,
		}));

		info!(target = "pixelcast.browser", pid, %target_id, width = config.width, height = config.height, "browser session ready");

		Ok(Self {
			connection,
			session_id,
			target_id,
			pid,
			poll_interval: config.poll_interval,
			closing,
			shutdown: Some(shutdown_tx),
			watcher: Some(watcher),
			message_loop: Some(message_loop),
		})
	}

	/// Wraps a page already attached over `connection`.
	///
	/// No browser process is owned, so nothing watches for crashes and
	/// [`close`](Self::close) only shuts the connection.
	pub fn from_connection(
		connection: Connection,
		target_id: impl Into<String>,
		session_id: impl Into<String>,
		poll_interval: Duration,
	) -> Self {
		let message_loop = connection.spawn();
		Self {
			connection,
			session_id: session_id.into(),
			target_id: target_id.into(),
			pid: None,
			poll_interval,
			closing: Arc::new(AtomicBool::new(false)),
			shutdown: None,
			watcher: None,
			message_loop: Some(message_loop),
		}
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// Sends a command to the attached page.
	pub async fn command(&self, method: &str, params: Value) -> Result<Value> {
		Ok(self.connection.send(method, params, Some(&self.session_id)).await?)
	}

	/// Loads `url` and waits for its `load` event.
	pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
		let mut events = self.connection.subscribe();
		let session_id = self.session_id.as_str();

		let navigation = async {
			let result = self
				.connection
				.call::<NavigateResult>("Page.navigate", json!({ "url": url }), Some(session_id))
				.await
				.map_err(|e| Error::Navigation(format!("{url}: {e}")))?;
			if let Some(error_text) = result.error_text {
				return Err(Error::Navigation(format!("{url}: {error_text}")));
			}

			loop {
				match events.recv().await {
					Ok(event) if event.method == "Page.loadEventFired" && event.session_id.as_deref() == Some(session_id) => {
						return Ok(());
					}
					Ok(_) | Err(RecvError::Lagged(_)) => continue,
					Err(RecvError::Closed) => return Err(Error::Navigation(format!("{url}: connection closed"))),
				}
			}
		};

		info!(target = "pixelcast.browser", %url, "navigating");
		tokio::time::timeout(timeout, navigation)
			.await
			.map_err(|_| Error::timeout(format!("navigation to {url}"), timeout))?
	}

	/// Polls until `signal` holds.
	///
	/// Evaluation errors count as "not yet"; pages often throw while they are
	/// still wiring themselves up.
	pub async fn wait_for_signal(&self, signal: &Signal, timeout: Duration) -> Result<()> {
		let expression = signal.expression();
		let poll = async {
			loop {
				match self.evaluate(&expression).await {
					Ok(Value::Bool(true)) => return Ok(()),
					Ok(_) => {}
					Err(Error::Cdp(e)) if e.is_disconnect() => return Err(Error::Cdp(e)),
					Err(e) => debug!(target = "pixelcast.browser", error = %e, "readiness probe failed"),
				}
				tokio::time::sleep(self.poll_interval).await;
			}
		};

		tokio::time::timeout(timeout, poll)
			.await
			.map_err(|_| Error::timeout(signal.describe(), timeout))?
	}

	/// Waits for real content, proceeding anyway once `timeout` passes.
	///
	/// Returns whether the content actually showed up.
	pub async fn wait_for_content(&self, signal: &Signal, timeout: Duration) -> bool {
		match self.wait_for_signal(signal, timeout).await {
			Ok(()) => {
				info!(target = "pixelcast.browser", signal = %signal.describe(), "content ready");
				true
			}
			Err(e) => {
				warn!(target = "pixelcast.browser", error = %e, "content not detected, continuing anyway");
				false
			}
		}
	}

	/// Evaluates `expression` in the page, awaiting promises, and returns its
	/// JSON value.
	pub async fn evaluate(&self, expression: &str) -> Result<Value> {
		let result: EvaluateResult = self
			.connection
			.call(
				"Runtime.evaluate",
				json!({ "expression": expression, "returnByValue": true, "awaitPromise": true }),
				Some(&self.session_id),
			)
			.await?;

		if let Some(details) = result.exception_details {
			return Err(Error::Script(details.message()));
		}
		Ok(result.result.value.unwrap_or(Value::Null))
	}

	/// Exposes a host callback to page script as `window[name](payload)`.
	pub async fn add_binding(&self, name: &str) -> Result<()> {
		self.command("Runtime.addBinding", json!({ "name": name })).await?;
		Ok(())
	}

	/// Raw DevTools events; filter on [`session_id`](Self::session_id).
	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.connection.subscribe()
	}

	/// Shuts the browser down. Safe to call repeatedly.
	pub async fn close(&mut self) {
		if self.closing.swap(true, Ordering::SeqCst) {
			return;
		}

		if !self.connection.is_closed() {
			let polite = self.connection.send("Browser.close", json!({}), None);
			if tokio::time::timeout(CLOSE_TIMEOUT, polite).await.is_err() {
				debug!(target = "pixelcast.browser", "Browser.close did not answer in time");
			}
		}

		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}
		if let Some(watcher) = self.watcher.take() {
			if let Err(e) = watcher.await {
				warn!(target = "pixelcast.browser", error = %e, "browser watcher ended abnormally");
			}
		}

		self.connection.close().await;
		if let Some(message_loop) = self.message_loop.take() {
			message_loop.abort();
			let _ = message_loop.await;
		}
		info!(target = "pixelcast.browser", pid = self.pid, target_id = %self.target_id, "browser closed");
	}
}

impl Drop for BrowserSession {
	fn drop(&mut self) {
		self.closing.store(true, Ordering::SeqCst);
		if let Some(message_loop) = self.message_loop.take() {
			message_loop.abort();
		}
	}
}

type Attached = (Connection, JoinHandle<()>, String, String, broadcast::Receiver<Event>);

async fn attach(process: &BrowserProcess, config: &BrowserConfig) -> Result<Attached> {
	let (transport, message_rx) = WebSocketTransport::connect(process.ws_url()).await?;
	let connection = Connection::new(transport.into_transport_parts(message_rx));
	let message_loop = connection.spawn();
	let events = connection.subscribe();

	connection
		.send("Target.setDiscoverTargets", json!({ "discover": true }), None)
		.await?;
	let created: CreateTargetResult = connection
		.call("Target.createTarget", json!({ "url": "about:blank" }), None)
		.await?;
	let attached: AttachToTargetResult = connection
		.call(
			"Target.attachToTarget",
			json!({ "targetId": created.target_id, "flatten": true }),
			None,
		)
		.await?;
	let session = Some(attached.session_id.as_str());

	for domain in ["Page", "Runtime", "Inspector"] {
		connection.send(&format!("{domain}.enable"), json!({}), session).await?;
	}
	connection
		.send(
			"Emulation.setDeviceMetricsOverride",
			json!({
				"width": config.width,
				"height": config.height,
				"deviceScaleFactor": 1,
				"mobile": false,
			}),
			session,
		)
		.await?;

	Ok((connection, message_loop, created.target_id, attached.session_id, events))
}

struct WatchState {
	process: BrowserProcess,
	connection: Connection,
	events: broadcast::Receiver<Event>,
	session_id: String,
	target_id: String,
	faults: FaultSender,
	closing: Arc<AtomicBool>,
	shutdown: oneshot::Receiver<()>,
}

async fn watch_browser(mut state: WatchState) {
	let fault = loop {
		tokio::select! {
			_ = &mut state.shutdown => break None,
			status = state.process.wait() => {
				let detail = match status {
					Ok(status) => format!("browser process exited ({status})"),
					Err(e) => format!("browser process lost: {e}"),
				};
				break Some(Fault::BrowserExited(detail));
			}
			_ = state.connection.closed() => {
				break Some(Fault::BrowserExited("devtools connection closed".to_string()));
			}
			event = state.events.recv() => match event {
				Ok(event) => {
					if let Some(reason) = crash_reason(&event, &state.session_id, &state.target_id) {
						break Some(Fault::BrowserCrashed(reason));
					}
					log_page_event(&event, &state.session_id);
				}
				Err(RecvError::Lagged(skipped)) => {
					warn!(target = "pixelcast.browser", skipped, "browser watcher fell behind on events");
				}
				Err(RecvError::Closed) => break None,
			},
		}
	};

	if let Some(fault) = fault {
		if state.closing.load(Ordering::SeqCst) {
			debug!(target = "pixelcast.browser", %fault, "ignoring browser fault during close");
		} else {
			warn!(target = "pixelcast.browser", %fault, "browser failure");
			state.faults.raise(fault);
		}
	}

	if let Err(e) = state.process.kill().await {
		warn!(target = "pixelcast.browser", error = %e, "failed to reap browser process");
	}
}

/// Maps crash-like events for our page to a human-readable reason.
fn crash_reason(event: &Event, session_id: &str, target_id: &str) -> Option<String> {
	match event.method.as_str() {
		"Inspector.targetCrashed" if event.session_id.as_deref() == Some(session_id) => {
			Some("renderer crashed".to_string())
		}
		"Target.targetCrashed" => {
			let crashed: TargetCrashed = serde_json::from_value(event.params.clone()).ok()?;
			(crashed.target_id == target_id).then(|| {
				format!(
					"target crashed (status: {}, code: {})",
					crashed.status.as_deref().unwrap_or("unknown"),
					crashed.error_code.map_or_else(|| "none".to_string(), |c| c.to_string())
				)
			})
		}
		"Target.detachedFromTarget" => {
			let detached: DetachedFromTarget = serde_json::from_value(event.params.clone()).ok()?;
			let ours = detached.session_id == session_id || detached.target_id.as_deref() == Some(target_id);
			ours.then(|| "page target detached".to_string())
		}
		_ => None,
	}
}

fn log_page_event(event: &Event, session_id: &str) {
	if event.session_id.as_deref() != Some(session_id) {
		return;
	}
	match event.method.as_str() {
		"Runtime.consoleAPICalled" => {
			if let Ok(call) = serde_json::from_value::<ConsoleApiCalled>(event.params.clone()) {
				if call.kind == "error" {
					warn!(target = "pixelcast.browser", message = %call.text(), "page console error");
				} else {
					debug!(target = "pixelcast.browser", kind = %call.kind, message = %call.text(), "page console");
				}
			}
		}
		"Runtime.exceptionThrown" => {
			if let Ok(thrown) = serde_json::from_value::<ExceptionThrown>(event.params.clone()) {
				warn!(target = "pixelcast.browser", message = %thrown.exception_details.message(), "uncaught page exception");
			}
		}
		_ => {}
	}
}
