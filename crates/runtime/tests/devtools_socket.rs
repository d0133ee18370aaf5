//! Connection over a real WebSocket against a scripted DevTools peer.

use futures_util::{SinkExt, StreamExt};
use pixelcast_runtime::Connection;
use pixelcast_runtime::transport::WebSocketTransport;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn command_round_trip_and_event_over_websocket() {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let server = tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
		let (mut ws_tx, mut ws_rx) = ws.split();

		let incoming = ws_rx.next().await.unwrap().unwrap();
		let request: Value = match incoming {
			Message::Text(text) => serde_json::from_str(&text).unwrap(),
			other => panic!("unexpected frame: {other:?}"),
		};
		assert_eq!(request["method"], "Target.createTarget");
		assert_eq!(request["params"]["url"], "about:blank");

		let event = json!({ "method": "Target.targetCreated", "params": { "targetInfo": { "targetId": "T1" } } });
		ws_tx.send(Message::Text(event.to_string())).await.unwrap();

		let reply = json!({ "id": request["id"], "result": { "targetId": "T1" } });
		ws_tx.send(Message::Text(reply.to_string())).await.unwrap();

		let _ = ws_tx.close().await;
	});

	let url = format!("ws://{addr}");
	let (transport, message_rx) = WebSocketTransport::connect(&url).await.unwrap();
	let connection = Connection::new(transport.into_transport_parts(message_rx));
	let mut events = connection.subscribe();
	connection.spawn();

	let created: pixelcast_protocol::CreateTargetResult = connection
		.call("Target.createTarget", json!({ "url": "about:blank" }), None)
		.await
		.unwrap();
	assert_eq!(created.target_id, "T1");

	let event = events.recv().await.unwrap();
	assert_eq!(event.method, "Target.targetCreated");

	server.await.unwrap();
	connection.closed().await;
	assert!(connection.is_closed());
}
