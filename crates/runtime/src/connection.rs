//! DevTools command/response correlation and event fan-out.
//!
//! This module implements the request correlation layer on top of a
//! [`Transport`]. It handles:
//! - Generating unique command IDs
//! - Correlating responses with pending commands
//! - Distinguishing events from responses
//! - Broadcasting events to every subscriber
//!
//! # Message Flow
//!
//! 1. Caller invokes [`Connection::send`] with a method, params and optional session
//! 2. Connection assigns the next ID and parks a oneshot sender under it
//! 3. The command is serialized and sent via the transport
//! 4. The message loop receives the response and completes the oneshot
//! 5. Events are pushed into a broadcast channel instead
//!
//! A connection is cheap to clone; all clones share the same socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pixelcast_protocol::{Event, Message, Request};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Default bound for a single command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 4096;

type Pending = oneshot::Sender<Result<Value>>;

/// Shared handle to one DevTools socket.
#[derive(Clone)]
pub struct Connection {
	inner: Arc<Inner>,
}

struct Inner {
	last_id: AtomicU64,
	callbacks: Mutex<HashMap<u64, Pending>>,
	sender: tokio::sync::Mutex<Box<dyn Transport>>,
	receiver: Mutex<Option<(Box<dyn TransportReceiver>, mpsc::UnboundedReceiver<Value>)>>,
	events: broadcast::Sender<Event>,
	closed: watch::Sender<bool>,
	command_timeout: Duration,
}

impl Connection {
	/// Creates a connection over `parts`. Call [`run`](Self::run) or
	/// [`spawn`](Self::spawn) before sending.
	pub fn new(parts: TransportParts) -> Self {
		Self::with_timeout(parts, DEFAULT_COMMAND_TIMEOUT)
	}

	pub fn with_timeout(parts: TransportParts, command_timeout: Duration) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		let (closed, _) = watch::channel(false);
		Self {
			inner: Arc::new(Inner {
				last_id: AtomicU64::new(0),
				callbacks: Mutex::new(HashMap::new()),
				sender: tokio::sync::Mutex::new(parts.sender),
				receiver: Mutex::new(Some((parts.receiver, parts.message_rx))),
				events,
				closed,
				command_timeout,
			}),
		}
	}

	/// Runs the message loop on a background task.
	pub fn spawn(&self) -> JoinHandle<()> {
		let conn = self.clone();
		tokio::spawn(async move { conn.run().await })
	}

	/// Sends a command and awaits its result.
	///
	/// `session_id` routes the command to an attached target; `None` addresses
	/// the browser itself.
	pub async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}

		let id = self.inner.last_id.fetch_add(1, Ordering::SeqCst) + 1;
		let (tx, rx) = oneshot::channel();
		self.inner.callbacks.lock().insert(id, tx);

		// run() flips `closed` before draining callbacks, so a late insert is caught here.
		if self.is_closed() {
			self.inner.callbacks.lock().remove(&id);
			return Err(Error::ChannelClosed);
		}

		let request = Request {
			id,
			method: method.to_string(),
			params,
			session_id: session_id.map(str::to_string),
		};
		let payload = serde_json::to_value(&request)?;

		if let Err(e) = self.inner.sender.lock().await.send(payload).await {
			self.inner.callbacks.lock().remove(&id);
			return Err(e);
		}

		match tokio::time::timeout(self.inner.command_timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::ChannelClosed),
			Err(_) => {
				self.inner.callbacks.lock().remove(&id);
				Err(Error::Timeout {
					method: method.to_string(),
					ms: self.inner.command_timeout.as_millis() as u64,
				})
			}
		}
	}

	/// Like [`send`](Self::send) but deserializes the result.
	pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<T> {
		let value = self.send(method, params, session_id).await?;
		Ok(serde_json::from_value(value)?)
	}

	/// Subscribes to every event received after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.inner.events.subscribe()
	}

	pub fn is_closed(&self) -> bool {
		*self.inner.closed.borrow()
	}

	/// Resolves once the message loop has ended.
	pub async fn closed(&self) {
		let mut rx = self.inner.closed.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}

	/// Closes the sending half. The loop ends when the peer hangs up.
	pub async fn close(&self) {
		self.inner.sender.lock().await.close().await;
	}

	/// Dispatches inbound messages until the transport ends.
	///
	/// May only run once per connection; later calls return immediately.
	pub async fn run(&self) {
		let Some((receiver, mut message_rx)) = self.inner.receiver.lock().take() else {
			warn!(target = "pixelcast.cdp", "connection loop already started");
			return;
		};

		let transport_task = tokio::spawn(async move {
			if let Err(e) = receiver.run().await {
				debug!(target = "pixelcast.cdp", error = %e, "transport ended with error");
			}
		});

		while let Some(value) = message_rx.recv().await {
			self.dispatch(value);
		}

		debug!(target = "pixelcast.cdp", "message loop ended (transport closed)");
		self.inner.closed.send_replace(true);
		self.inner.callbacks.lock().clear();

		transport_task.abort();
		let _ = transport_task.await;
	}

	fn dispatch(&self, value: Value) {
		let message = match serde_json::from_value::<Message>(value) {
			Ok(message) => message,
			Err(e) => {
				debug!(target = "pixelcast.cdp", error = %e, "ignoring unrecognised message");
				return;
			}
		};

		match message {
			Message::Response(response) => {
				let Some(tx) = self.inner.callbacks.lock().remove(&response.id) else {
					debug!(target = "pixelcast.cdp", id = response.id, "response for unknown command");
					return;
				};
				let result = match response.error {
					Some(error) => Err(Error::Protocol {
						code: error.code,
						message: error.message,
					}),
					None => Ok(response.result.unwrap_or(Value::Null)),
				};
				let _ = tx.send(result);
			}
			Message::Event(event) => {
				let _ = self.inner.events.send(event);
			}
		}
	}
}
