//! The slice of JSON-RPC 2.0 the pool speaks with language servers.
//!
//! Outbound traffic needs no general request model: the pool writes exactly
//! three message shapes (its own requests with monotonically increasing
//! integer IDs, notifications, and replies to server-initiated requests), so
//! each is a serialize-only envelope rendered straight to a frame body.
//! Inbound traffic is the opposite problem — servers disagree about optional
//! members, and one odd message must never take the connection down — so
//! incoming frames are field-sniffed into whichever of the four kinds the
//! fields add up to instead of being forced through strict union types.

pub(crate) use self::pending::Pending;

mod pending;

use serde::Serialize;
use serde_json::Value;

use crate::error::ServerError;

const VERSION: &str = "2.0";

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    params: Value,
}

#[derive(Serialize)]
struct NotificationEnvelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ServerError>,
}

/// Renders the frame body of one of the pool's own requests.
pub(crate) fn request_body(id: i64, method: &str, params: Value) -> String {
    encode(&RequestEnvelope {
        jsonrpc: VERSION,
        id,
        method,
        params,
    })
}

/// Renders the frame body of a notification.
pub(crate) fn notification_body(method: &str, params: Value) -> String {
    encode(&NotificationEnvelope {
        jsonrpc: VERSION,
        method,
        params,
    })
}

/// Renders the frame body of a reply to a server-initiated request.
///
/// The id is echoed back verbatim in whatever shape the server chose for it.
pub(crate) fn response_body(id: Value, outcome: Result<Value, ServerError>) -> String {
    let (result, error) = match outcome {
        Ok(result) => (Some(result), None),
        Err(error) => (None, Some(error)),
    };
    encode(&ResponseEnvelope {
        jsonrpc: VERSION,
        id,
        result,
        error,
    })
}

fn encode<T: Serialize>(envelope: &T) -> String {
    // Envelopes hold only JSON-native data, so this cannot fail in practice;
    // an empty body is skipped by the framing codec rather than written.
    serde_json::to_string(envelope).unwrap_or_default()
}

/// A message read off a server's stdout, with every member optional so no
/// single missing or oddly-typed field can poison the read loop.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ServerError>,
    #[serde(default)]
    params: Option<Value>,
}

/// What an [`Incoming`] message turned out to be.
#[derive(Debug)]
pub(crate) enum IncomingKind {
    /// An answer to one of the pool's own requests.
    Response {
        id: i64,
        outcome: Result<Value, ServerError>,
    },
    /// A request from the server that expects a reply echoing `id`.
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A notification from the server.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Nothing the pool can correlate or answer.
    Unusable(&'static str),
}

impl Incoming {
    pub(crate) fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Sorts the message into its kind by which fields are present.
    ///
    /// A response whose id is not an integer cannot be one of ours (the pool
    /// only ever issues integer IDs) and is reported as unusable rather than
    /// guessed at. A response carrying neither `result` nor `error` counts
    /// as a null result, which matches what permissive servers send.
    pub(crate) fn classify(self) -> IncomingKind {
        match (self.id, self.method) {
            (Some(id), Some(method)) => IncomingKind::ServerRequest {
                id,
                method,
                params: self.params,
            },
            (None, Some(method)) => IncomingKind::Notification {
                method,
                params: self.params,
            },
            (Some(id), None) => match id.as_i64() {
                Some(id) => {
                    let outcome = match self.error {
                        Some(error) => Err(error),
                        None => Ok(self.result.unwrap_or(Value::Null)),
                    };
                    IncomingKind::Response { id, outcome }
                }
                None => IncomingKind::Unusable("response id is not an integer"),
            },
            (None, None) => IncomingKind::Unusable("message has neither id nor method"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parsed(text: &str) -> IncomingKind {
        Incoming::parse(text).unwrap().classify()
    }

    #[test]
    fn request_body_carries_id_method_and_params() {
        let body = request_body(7, "textDocument/hover", json!({ "x": 1 }));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["jsonrpc"], json!("2.0"));
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["method"], json!("textDocument/hover"));
        assert_eq!(value["params"], json!({ "x": 1 }));
    }

    #[test]
    fn notification_body_has_no_id() {
        let body = notification_body("initialized", json!({}));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["method"], json!("initialized"));
        assert!(value.get("id").is_none());
    }

    #[test]
    fn response_body_echoes_string_ids_verbatim() {
        let body = response_body(json!("reg-1"), Ok(Value::Null));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["id"], json!("reg-1"));
        assert_eq!(value["result"], Value::Null);
        assert!(value.get("error").is_none());

        let body = response_body(json!(3), Err(ServerError::method_not_found("x/y")));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"]["code"], json!(-32601));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn classifies_responses() {
        let ok = parsed(r#"{"jsonrpc":"2.0","id":4,"result":{"v":1}}"#);
        match ok {
            IncomingKind::Response { id, outcome } => {
                assert_eq!(id, 4);
                assert_eq!(outcome.unwrap(), json!({ "v": 1 }));
            }
            other => panic!("expected response, got {:?}", other),
        }

        let err = parsed(r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"nope"}}"#);
        match err {
            IncomingKind::Response { id, outcome } => {
                assert_eq!(id, 5);
                let error = outcome.unwrap_err();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "nope");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn null_and_missing_results_both_count_as_null() {
        for text in [
            r#"{"jsonrpc":"2.0","id":1,"result":null}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
        ] {
            match parsed(text) {
                IncomingKind::Response { outcome, .. } => {
                    assert_eq!(outcome.unwrap(), Value::Null)
                }
                other => panic!("expected response, got {:?}", other),
            }
        }
    }

    #[test]
    fn classifies_server_traffic() {
        let request =
            parsed(r#"{"jsonrpc":"2.0","id":"cfg-0","method":"workspace/configuration","params":{"items":[]}}"#);
        match request {
            IncomingKind::ServerRequest { id, method, .. } => {
                assert_eq!(id, json!("cfg-0"));
                assert_eq!(method, "workspace/configuration");
            }
            other => panic!("expected server request, got {:?}", other),
        }

        let notification =
            parsed(r#"{"jsonrpc":"2.0","method":"textDocument/publishDiagnostics","params":{}}"#);
        assert!(matches!(
            notification,
            IncomingKind::Notification { method, .. } if method == "textDocument/publishDiagnostics"
        ));
    }

    #[test]
    fn odd_messages_are_unusable_not_fatal() {
        assert!(matches!(
            parsed(r#"{"jsonrpc":"2.0","id":"weird","result":{}}"#),
            IncomingKind::Unusable(_)
        ));
        assert!(matches!(
            parsed(r#"{"jsonrpc":"2.0"}"#),
            IncomingKind::Unusable(_)
        ));
        // A failed notification: error with a null id correlates to nothing.
        assert!(matches!(
            parsed(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad"}}"#),
            IncomingKind::Unusable(_)
        ));
    }
}
