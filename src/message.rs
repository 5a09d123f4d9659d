use ds_client::RpcResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message travelling along the wires of a flow.
///
/// Every member except `payload` is optional and validated where it is consumed. `res` is the
/// live response handle of an RPC invocation; it never serialises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMessage {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// User identifier; numbers and strings are both accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_app_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_app_name: Option<String>,
    #[serde(skip)]
    pub res: Option<RpcResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl FlowMessage {
    pub fn new(payload: Value) -> Self {
        Self { id: new_id(), payload, ..Default::default() }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_uid(mut self, uid: impl Into<Value>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_app(mut self, uri: impl Into<String>, name: impl Into<String>) -> Self {
        self.app_uri = Some(uri.into());
        self.app_name = Some(name.into());
        self
    }

    pub fn with_next_app(mut self, uri: impl Into<String>, name: impl Into<String>) -> Self {
        self.next_app_uri = Some(uri.into());
        self.next_app_name = Some(name.into());
        self
    }

    pub fn with_response(mut self, res: RpcResponse) -> Self {
        self.res = Some(res);
        self
    }

    pub fn with_err(mut self, err: impl Into<String>) -> Self {
        self.err = Some(err.into());
        self
    }

    /// `uid` as a path segment. `None` when missing, null or not a scalar.
    pub fn uid_segment(&self) -> Option<String> {
        match self.uid.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// `record_path` if given, else the session record `user/<uid>`.
    pub fn session_record(&self) -> Option<String> {
        if let Some(path) = self.record_path.as_ref().filter(|p| !p.is_empty()) {
            return Some(path.clone());
        }
        self.uid_segment().map(|uid| session_record_for(&uid))
    }
}

/// Name of the per-user session record.
pub fn session_record_for(uid: &str) -> String {
    format!("user/{uid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialises_sparse_messages() {
        let msg: FlowMessage = serde_json::from_value(json!({"payload": 42, "uid": 7})).unwrap();
        assert_eq!(msg.payload, json!(42));
        assert_eq!(msg.uid_segment(), Some("7".to_string()));
        assert!(msg.topic.is_none());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn session_record_prefers_explicit_path() {
        let msg = FlowMessage::new(json!(null)).with_uid("42");
        assert_eq!(msg.session_record(), Some("user/42".to_string()));

        let mut explicit = msg.clone();
        explicit.record_path = Some("user/other".into());
        assert_eq!(explicit.session_record(), Some("user/other".to_string()));

        assert_eq!(FlowMessage::new(json!(1)).session_record(), None);
    }

    #[test]
    fn response_handle_is_not_serialised() {
        let (res, _rx) = RpcResponse::new("sum");
        let msg = FlowMessage::new(json!([2, 3])).with_response(res);
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("res").is_none());
        assert_eq!(value["payload"], json!([2, 3]));
    }
}
