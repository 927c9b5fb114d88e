//! Messages on the wire

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame = one message, serialized as `type`-tagged JSON.
///
/// `hello` is only valid as the first frame in each direction. A `call` is
/// matched to its response (`result` / `error`) by `id`; `notify` has no
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        data: Value,
    },
    Call {
        id: u64,
        method: String,
        params: Value,
    },
    #[serde(rename = "result")]
    Reply {
        id: u64,
        value: Value,
    },
    Error {
        id: u64,
        kind: String,
        message: String,
    },
    Notify {
        method: String,
        params: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_format() {
        let msg = Message::Call {
            id: 7,
            method: "run".to_string(),
            params: json!({"task_id": "t1"}),
        };
        let s = serde_json::to_string(&msg).unwrap();
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["type"], "call");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "run");
        assert_eq!(v["params"]["task_id"], "t1");
    }

    #[test]
    fn test_reply_uses_result_tag() {
        let msg = Message::Reply {
            id: 1,
            value: json!({}),
        };
        let v: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "result");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = serde_json::from_str::<Message>(r#"{"type":"frobnicate"}"#);
        assert!(err.is_err());
    }
}
