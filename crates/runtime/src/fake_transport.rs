//! Fake transport for unit testing command correlation and event dispatch.
//!
//! Provides an in-memory transport for testing the protocol layer without a
//! browser.
//!
//! # Example
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! let connection = Connection::new(parts);
//! tokio::spawn({
//!     let conn = connection.clone();
//!     async move { conn.run().await }
//! });
//!
//! let fut = connection.send("Page.navigate", json!({ "url": "about:blank" }), None);
//! controller.inject_response(1, json!({ "frameId": "F" }));
//! let result = fut.await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::Result;
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Computes the reply body (`{"result": ..}` or `{"error": ..}`) for a sent command.
pub type Responder = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Builder for creating fake transport instances.
#[derive(Default)]
pub struct FakeTransportBuilder {
	responder: Option<Responder>,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Answers every sent command with an empty `result` object.
	pub fn auto_reply(self) -> Self {
		self.respond_with(|_| json!({ "result": {} }))
	}

	/// Answers every sent command with whatever `responder` returns for it.
	pub fn respond_with<F>(mut self, responder: F) -> Self
	where
		F: Fn(&Value) -> Value + Send + Sync + 'static,
	{
		self.responder = Some(Arc::new(responder));
		self
	}

	/// Builds the transport parts and a controller for driving them.
	pub fn build(self) -> (TransportParts, FakeTransportController) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let sent = Arc::new(Mutex::new(Vec::new()));
		let disconnect = Arc::new(Notify::new());

		let sender = FakeTransportSender {
			sent: Arc::clone(&sent),
			responder: self.responder.map(|responder| (responder, inbound_tx.clone())),
		};
		let receiver = FakeTransportReceiver {
			inbound_rx,
			message_tx,
			disconnect: Arc::clone(&disconnect),
		};
		let controller = FakeTransportController { inbound_tx, sent, disconnect };

		let parts = TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		};

		(parts, controller)
	}
}

/// Controller for injecting responses/events and inspecting sent messages.
#[derive(Clone)]
pub struct FakeTransportController {
	inbound_tx: mpsc::UnboundedSender<Value>,
	sent: Arc<Mutex<Vec<Value>>>,
	disconnect: Arc<Notify>,
}

impl FakeTransportController {
	/// Injects a raw JSON message as if the browser had sent it.
	pub fn inject(&self, message: Value) {
		let _ = self.inbound_tx.send(message);
	}

	pub fn inject_response(&self, id: u64, result: Value) {
		self.inject(json!({ "id": id, "result": result }));
	}

	pub fn inject_error(&self, id: u64, code: i64, message: &str) {
		self.inject(json!({ "id": id, "error": { "code": code, "message": message } }));
	}

	pub fn inject_event(&self, method: &str, params: Value, session_id: Option<&str>) {
		let mut event = json!({ "method": method, "params": params });
		if let Some(session_id) = session_id {
			event["sessionId"] = Value::String(session_id.to_string());
		}
		self.inject(event);
	}

	/// Simulates the browser dropping the socket.
	pub fn disconnect(&self) {
		self.disconnect.notify_one();
	}

	/// Takes all sent messages, clearing the buffer.
	pub async fn take_sent(&self) -> Vec<Value> {
		std::mem::take(&mut *self.sent.lock().await)
	}
}

struct FakeTransportSender {
	sent: Arc<Mutex<Vec<Value>>>,
	responder: Option<(Responder, mpsc::UnboundedSender<Value>)>,
}

impl Transport for FakeTransportSender {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		let sent = Arc::clone(&self.sent);
		let responder = self.responder.clone();
		Box::pin(async move {
			if let (Some((respond, tx)), Some(id)) = (responder, message.get("id").cloned()) {
				let mut reply = respond(&message);
				reply["id"] = id;
				let _ = tx.send(reply);
			}
			sent.lock().await.push(message);
			Ok(())
		})
	}
}

struct FakeTransportReceiver {
	inbound_rx: mpsc::UnboundedReceiver<Value>,
	message_tx: mpsc::UnboundedSender<Value>,
	disconnect: Arc<Notify>,
}

impl TransportReceiver for FakeTransportReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			loop {
				let message = tokio::select! {
					message = self.inbound_rx.recv() => message,
					_ = self.disconnect.notified() => None,
				};
				let Some(message) = message else { break };
				if self.message_tx.send(message).is_err() {
					break;
				}
			}
			Ok(())
		})
	}
}
