//! JSON-RPC message shapes exchanged with the server.

use std::path::Path;

use serde::Serialize;

use crate::channel::ProgressEvent;
use crate::types::StatusSnapshot;

pub(crate) const JSONRPC_VERSION: &str = "2.0";

const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Reply to a request the server sent us.
pub(crate) fn reply_result(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub(crate) fn reply_method_not_found(id: &serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

/// A decoded inbound frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl Incoming {
    /// Classify a frame by which of `id`/`method`/`result|error` it carries.
    pub fn classify(frame: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(mut object) = frame else {
            return None;
        };
        let method = match object.remove("method") {
            Some(serde_json::Value::String(method)) => Some(method),
            Some(_) => return None,
            None => None,
        };
        let params = object.remove("params");
        let is_response = object.contains_key("result") || object.contains_key("error");

        match (object.get("id").cloned(), method) {
            (Some(id), None) if is_response => Some(Self::Response {
                id: id.as_u64()?,
                body: serde_json::Value::Object(object),
            }),
            (Some(id), Some(method)) => Some(Self::ServerRequest { id, method, params }),
            (None, Some(method)) => Some(Self::Notification { method, params }),
            _ => None,
        }
    }
}

pub(crate) fn initialize_params(
    root_uri: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "window": {
                "workDoneProgress": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

/// Decode `$/progress` params. Unknown kinds and non-object values are
/// dropped.
pub(crate) fn parse_progress(params: &serde_json::Value) -> Option<ProgressEvent> {
    let value = params.get("value")?.as_object()?;
    let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(String::from);

    match value.get("kind")?.as_str()? {
        "begin" => Some(ProgressEvent::Begin {
            title: text("title").unwrap_or_default(),
            message: text("message"),
        }),
        "report" => Some(ProgressEvent::Report {
            message: text("message"),
        }),
        "end" => Some(ProgressEvent::End {
            message: text("message"),
        }),
        _ => None,
    }
}

pub(crate) fn parse_status(params: serde_json::Value) -> Result<StatusSnapshot, serde_json::Error> {
    serde_json::from_value(params)
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: std::path::PathBuf,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_directory_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Health;

    #[test]
    fn test_classify_response() {
        let incoming = Incoming::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "result": { "capabilities": {} }
        }))
        .unwrap();
        match incoming {
            Incoming::Response { id, body } => {
                assert_eq!(id, 3);
                assert!(body["result"]["capabilities"].is_object());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let incoming = Incoming::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": 4, "error": { "code": -32600, "message": "bad" }
        }));
        assert!(matches!(incoming, Some(Incoming::Response { id: 4, .. })));
    }

    #[test]
    fn test_classify_server_request_keeps_string_id() {
        let incoming = Incoming::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": "abc", "method": "window/workDoneProgress/create",
            "params": { "token": "t1" }
        }))
        .unwrap();
        assert_eq!(
            incoming,
            Incoming::ServerRequest {
                id: serde_json::json!("abc"),
                method: "window/workDoneProgress/create".into(),
                params: Some(serde_json::json!({ "token": "t1" })),
            }
        );
    }

    #[test]
    fn test_classify_notification() {
        let incoming = Incoming::classify(serde_json::json!({
            "jsonrpc": "2.0", "method": "tether/status", "params": { "quiescent": true }
        }))
        .unwrap();
        assert!(matches!(
            incoming,
            Incoming::Notification { ref method, .. } if method == "tether/status"
        ));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(Incoming::classify(serde_json::json!([1, 2])).is_none());
        assert!(Incoming::classify(serde_json::json!({ "jsonrpc": "2.0" })).is_none());
        assert!(Incoming::classify(serde_json::json!({ "id": "x", "result": 1 })).is_none());
        assert!(Incoming::classify(serde_json::json!({ "method": 5 })).is_none());
    }

    #[test]
    fn test_parse_progress_kinds() {
        let begin = parse_progress(&serde_json::json!({
            "token": 1,
            "value": { "kind": "begin", "title": "Gradle", "message": "Resolving dependencies" }
        }));
        assert_eq!(
            begin,
            Some(ProgressEvent::Begin {
                title: "Gradle".into(),
                message: Some("Resolving dependencies".into()),
            })
        );

        let report = parse_progress(&serde_json::json!({
            "token": 1, "value": { "kind": "report", "percentage": 40 }
        }));
        assert_eq!(report, Some(ProgressEvent::Report { message: None }));

        let end = parse_progress(&serde_json::json!({
            "token": 1, "value": { "kind": "end", "message": "done" }
        }));
        assert_eq!(
            end,
            Some(ProgressEvent::End {
                message: Some("done".into())
            })
        );
    }

    #[test]
    fn test_parse_progress_ignores_unknown_kind() {
        assert!(parse_progress(&serde_json::json!({ "value": { "kind": "pause" } })).is_none());
        assert!(parse_progress(&serde_json::json!({ "value": 3 })).is_none());
        assert!(parse_progress(&serde_json::json!({})).is_none());
    }

    #[test]
    fn test_parse_status() {
        let snapshot = parse_status(serde_json::json!({
            "health": "error", "quiescent": true, "errorCode": "X"
        }))
        .unwrap();
        assert_eq!(snapshot.health, Health::Error);
        assert_eq!(snapshot.error_code.as_deref(), Some("X"));

        assert!(parse_status(serde_json::json!({ "health": "sick" })).is_err());
    }

    #[test]
    fn test_initialize_params_advertise_work_done_progress() {
        let params = initialize_params("file:///ws/", Some(&serde_json::json!({ "a": 1 })));
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///ws/");
        assert_eq!(params["capabilities"]["window"]["workDoneProgress"], true);
        assert_eq!(params["initializationOptions"]["a"], 1);

        let bare = initialize_params("file:///ws/", None);
        assert!(bare.get("initializationOptions").is_none());
    }

    #[test]
    fn test_replies() {
        let ok = reply_result(&serde_json::json!(9), serde_json::Value::Null);
        assert_eq!(ok["id"], 9);
        assert!(ok["result"].is_null());

        let err = reply_method_not_found(&serde_json::json!(10), "client/registerCapability");
        assert_eq!(err["error"]["code"], -32601);
        assert!(
            err["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    #[test]
    fn test_request_omits_absent_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["method"], "shutdown");
        assert!(json.get("params").is_none());

        let json = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_directory_uri_has_trailing_slash() {
        let uri = path_to_file_uri(Path::new("/home/test/project")).unwrap();
        assert_eq!(uri.as_str(), "file:///home/test/project/");
        assert!(path_to_file_uri(Path::new("relative")).is_err());
    }
}
