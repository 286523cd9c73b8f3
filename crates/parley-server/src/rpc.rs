use serde::{Deserialize, Serialize};

use parley_service::ServiceError;

/// Inbound client frame: `{ method, params?, id? }`.
#[derive(Debug, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Outbound acknowledgement: `{ id, success, result? | error? }`.
#[derive(Debug, Serialize)]
pub struct WireResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self { id, success: true, result: Some(result), error: None }
    }

    pub fn error(
        id: Option<serde_json::Value>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(WireError { code: code.into(), message: message.into() }),
        }
    }

    pub fn from_service_error(id: Option<serde_json::Value>, err: &ServiceError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, "METHOD_NOT_FOUND", format!("unknown method: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, message: impl Into<String>) -> Self {
        Self::error(id, "INVALID_PARAMS", message)
    }

    pub fn parse_error() -> Self {
        Self::error(None, "PARSE_ERROR", "frame is not valid JSON")
    }
}

/// Extract a required string param.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required parameter: {key}"))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn optional_u32(params: &serde_json::Value, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request() {
        let raw = r#"{"method":"sendMessageToUser","params":{"receiverId":"bob","content":"hi"},"id":1}"#;
        let req: WireRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "sendMessageToUser");
        assert_eq!(req.id, Some(json!(1)));
        assert_eq!(require_str(req.params.as_ref().unwrap(), "receiverId").unwrap(), "bob");
    }

    #[test]
    fn success_ack_omits_error() {
        let resp = WireResponse::success(Some(json!(7)), json!({"ok": true}));
        let raw = serde_json::to_string(&resp).unwrap();
        assert!(raw.contains("\"success\":true"));
        assert!(!raw.contains("\"error\""));
    }

    #[test]
    fn error_ack_carries_code_and_message() {
        let err = ServiceError::Forbidden("not a participant".into());
        let resp = WireResponse::from_service_error(Some(json!(7)), &err);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "FORBIDDEN");
        assert!(value["error"]["message"].as_str().unwrap().contains("not a participant"));
    }

    #[test]
    fn param_helpers() {
        let params = json!({"name": "x", "limit": 25, "isTyping": true});
        assert_eq!(require_str(&params, "name").unwrap(), "x");
        assert!(require_str(&params, "limit").is_err());
        assert_eq!(optional_u32(&params, "limit"), Some(25));
        assert_eq!(optional_bool(&params, "isTyping"), Some(true));
        assert_eq!(optional_str(&params, "missing"), None);
    }
}
