//! JSON-RPC 2.0 envelope
//!
//! Requests are validated field by field before dispatch: a request must be
//! an object with `"jsonrpc": "2.0"`, a string `method`, optional object
//! `params` and a string or integer `id`. A request without an id is a
//! notification and gets no response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{FormatError, PortError, ServerError, SessionError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes carried in `error.code`
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const RESOURCE_NOT_FOUND: i64 = 1301;
    pub const DUPLICATE_ID: i64 = 1302;
    pub const INVALID_TRANSITION: i64 = 1303;

    pub const PORT_NOT_FOUND: i64 = 2000;
    pub const PORT_BUSY: i64 = 2001;
    pub const PORT_IO_FAILURE: i64 = 2002;

    pub const MALFORMED_FILE: i64 = 2100;
    pub const UNSUPPORTED_EVENT: i64 = 2101;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {}", detail))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid parameters: {}", detail))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {}", detail))
    }
}

/// Code for each server error
pub fn error_code(error: &ServerError) -> i64 {
    match error {
        ServerError::Port(PortError::NotFound(_)) => codes::PORT_NOT_FOUND,
        ServerError::Port(PortError::Busy(_)) => codes::PORT_BUSY,
        ServerError::Port(PortError::IoFailure(_)) => codes::PORT_IO_FAILURE,
        ServerError::Session(SessionError::NotFound(_)) => codes::RESOURCE_NOT_FOUND,
        ServerError::Session(SessionError::DuplicateId(_)) => codes::DUPLICATE_ID,
        ServerError::Session(SessionError::InvalidTransition { .. }) => codes::INVALID_TRANSITION,
        ServerError::Format(FormatError::MalformedFile(_)) => codes::MALFORMED_FILE,
        ServerError::Format(FormatError::UnsupportedEvent(_)) => codes::UNSUPPORTED_EVENT,
        ServerError::Validation(_) | ServerError::InvalidParams(_) => codes::INVALID_PARAMS,
        ServerError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
        ServerError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
            codes::RESOURCE_NOT_FOUND
        }
        ServerError::Io(_) | ServerError::Config(_) => codes::INTERNAL_ERROR,
    }
}

impl From<&ServerError> for RpcError {
    fn from(error: &ServerError) -> Self {
        Self::new(error_code(error), error.to_string())
    }
}

/// A validated request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// `None` for notifications
    pub id: Option<RequestId>,
    pub method: String,
    /// Object, or `Null` when absent
    pub params: Value,
}

/// A request that failed validation, with its id when one could be read
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse and validate one line of input
    pub fn parse(line: &str) -> Result<Request, Rejected> {
        let value: Value = serde_json::from_str(line).map_err(|e| Rejected {
            id: None,
            error: RpcError::parse_error(e),
        })?;
        let Value::Object(obj) = value else {
            return Err(Rejected {
                id: None,
                error: RpcError::invalid_request("request must be an object"),
            });
        };

        let id = match obj.get("id") {
            None => None,
            Some(Value::String(s)) => Some(RequestId::String(s.clone())),
            Some(Value::Number(n)) if n.is_i64() => n.as_i64().map(RequestId::Number),
            Some(_) => {
                return Err(Rejected {
                    id: None,
                    error: RpcError::invalid_request("'id' must be a string or integer"),
                })
            }
        };
        let reject = |msg: &str| Rejected {
            id: id.clone(),
            error: RpcError::invalid_request(msg),
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(_) => return Err(reject("'jsonrpc' must be \"2.0\"")),
            None => return Err(reject("missing 'jsonrpc'")),
        }

        let method = match obj.get("method") {
            Some(Value::String(m)) if !m.is_empty() => m.clone(),
            Some(_) => return Err(reject("'method' must be a non-empty string")),
            None => return Err(reject("missing 'method'")),
        };

        let params = match obj.get("params") {
            None | Some(Value::Null) => Value::Null,
            Some(p @ Value::Object(_)) => p.clone(),
            Some(_) => return Err(reject("'params' must be an object")),
        };

        Ok(Request { id, method, params })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-initiated notification
pub fn notification(method: &str, params: Value) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
    obj.insert("method".into(), json!(method));
    obj.insert("params".into(), params);
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_parse_request() {
        let req = Request::parse(
            r#"{"jsonrpc":"2.0","method":"noteOn","params":{"channel":0},"id":7}"#,
        )
        .unwrap();
        assert_eq!(req.id, Some(RequestId::Number(7)));
        assert_eq!(req.method, "noteOn");
        assert_eq!(req.params["channel"], 0);

        let req = Request::parse(r#"{"jsonrpc":"2.0","method":"listPorts","id":"a"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::String("a".into())));
        assert!(req.params.is_null());

        let req = Request::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_rejections() {
        let err = Request::parse("{not json").unwrap_err();
        assert_eq!(err.error.code, codes::PARSE_ERROR);
        assert_eq!(err.id, None);

        let cases = [
            r#"[1,2]"#,
            r#"{"jsonrpc":"1.0","method":"x","id":1}"#,
            r#"{"method":"x","id":1}"#,
            r#"{"jsonrpc":"2.0","method":5,"id":1}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","method":"x","params":[1],"id":1}"#,
            r#"{"jsonrpc":"2.0","method":"x","id":1.5}"#,
            r#"{"jsonrpc":"2.0","method":"x","id":{}}"#,
        ];
        for case in cases {
            let err = Request::parse(case).unwrap_err();
            assert_eq!(err.error.code, codes::INVALID_REQUEST, "{}", case);
        }

        // The id is echoed back when it could be read
        let err = Request::parse(r#"{"jsonrpc":"1.0","method":"x","id":9}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(9)));
    }

    #[test]
    fn test_error_codes() {
        let cases: Vec<(ServerError, i64)> = vec![
            (PortError::Busy("p".into()).into(), codes::PORT_BUSY),
            (SessionError::NotFound("s".into()).into(), codes::RESOURCE_NOT_FOUND),
            (SessionError::DuplicateId("s".into()).into(), codes::DUPLICATE_ID),
            (FormatError::UnsupportedEvent("e".into()).into(), codes::UNSUPPORTED_EVENT),
            (ValidationError::ChannelOutOfRange(16).into(), codes::INVALID_PARAMS),
            (ServerError::MethodNotFound("m".into()), codes::METHOD_NOT_FOUND),
        ];
        for (error, code) in cases {
            assert_eq!(error_code(&error), code, "{}", error);
        }
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(Response::success(
            Some(RequestId::Number(1)),
            json!({"ok": true}),
        ))
        .unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}));

        let err = serde_json::to_value(Response::failure(None, RpcError::parse_error("eof")))
            .unwrap();
        assert_eq!(err["id"], Value::Null);
        assert_eq!(err["error"]["code"], -32700);
        assert!(err.get("result").is_none());
    }
}
