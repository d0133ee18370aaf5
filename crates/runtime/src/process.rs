//! Port helpers shared by the launcher and the relay.

use std::net::TcpListener;

/// Returns `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
	TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Asks the OS for an unused localhost port.
///
/// The port is released before returning, so a racing process may grab it;
/// callers that bind it themselves should treat a bind failure as retryable.
pub fn free_local_port() -> std::io::Result<u16> {
	let listener = TcpListener::bind(("127.0.0.1", 0))?;
	Ok(listener.local_addr()?.port())
}
