//! Typed command results and event payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `/json/version` response subset from the DevTools HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	pub web_socket_debugger_url: String,
	#[serde(rename = "Browser")]
	pub browser: Option<String>,
	#[serde(rename = "Protocol-Version")]
	pub protocol_version: Option<String>,
}

/// `Target.createTarget` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetResult {
	pub target_id: String,
}

/// `Target.attachToTarget` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetResult {
	pub session_id: String,
}

/// `Page.navigate` result. `error_text` is set when the navigation failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResult {
	pub frame_id: String,
	#[serde(default)]
	pub error_text: Option<String>,
}

/// Mirror object returned by `Runtime.evaluate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub subtype: Option<String>,
	#[serde(default)]
	pub class_name: Option<String>,
	#[serde(default)]
	pub value: Option<Value>,
	#[serde(default)]
	pub description: Option<String>,
}

/// Details of an exception thrown while evaluating script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
	pub text: String,
	#[serde(default)]
	pub line_number: Option<i64>,
	#[serde(default)]
	pub column_number: Option<i64>,
	#[serde(default)]
	pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
	/// Human readable message, preferring the thrown object's description.
	pub fn message(&self) -> String {
		self.exception
			.as_ref()
			.and_then(|e| e.description.clone())
			.unwrap_or_else(|| self.text.clone())
	}
}

/// `Runtime.evaluate` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
	pub result: RemoteObject,
	#[serde(default)]
	pub exception_details: Option<ExceptionDetails>,
}

/// `Runtime.bindingCalled` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingCalled {
	pub name: String,
	pub payload: String,
	#[serde(default)]
	pub execution_context_id: Option<i64>,
}

/// `Runtime.consoleAPICalled` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalled {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub args: Vec<RemoteObject>,
}

impl ConsoleApiCalled {
	/// Joins the console arguments the way the devtools console renders them.
	pub fn text(&self) -> String {
		self.args
			.iter()
			.map(|arg| match &arg.value {
				Some(Value::String(s)) => s.clone(),
				Some(other) => other.to_string(),
				None => arg.description.clone().unwrap_or_else(|| arg.kind.clone()),
			})
			.collect::<Vec<_>>()
			.join(" ")
	}
}

/// `Runtime.exceptionThrown` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrown {
	pub exception_details: ExceptionDetails,
}

/// `Target.targetCrashed` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCrashed {
	pub target_id: String,
	#[serde(default)]
	pub status: Option<String>,
	#[serde(default)]
	pub error_code: Option<i64>,
}

/// `Target.detachedFromTarget` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
	pub session_id: String,
	#[serde(default)]
	pub target_id: Option<String>,
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn version_info_reads_devtools_field_names() {
		let info: VersionInfo = serde_json::from_value(json!({
			"Browser": "HeadlessChrome/126.0.0.0",
			"Protocol-Version": "1.3",
			"webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
		}))
		.unwrap();
		assert_eq!(info.web_socket_debugger_url, "ws://127.0.0.1:9222/devtools/browser/abc");
		assert_eq!(info.browser.as_deref(), Some("HeadlessChrome/126.0.0.0"));
	}

	#[test]
	fn exception_message_prefers_description() {
		let details: ExceptionDetails = serde_json::from_value(json!({
			"text": "Uncaught",
			"exception": { "type": "object", "description": "ReferenceError: audioContext is not defined" }
		}))
		.unwrap();
		assert_eq!(details.message(), "ReferenceError: audioContext is not defined");
	}

	#[test]
	fn console_text_joins_values() {
		let console: ConsoleApiCalled = serde_json::from_value(json!({
			"type": "error",
			"args": [
				{ "type": "string", "value": "MediaRecorder error:" },
				{ "type": "number", "value": 42 },
				{ "type": "object", "description": "DOMException" }
			]
		}))
		.unwrap();
		assert_eq!(console.text(), "MediaRecorder error: 42 DOMException");
	}
}
