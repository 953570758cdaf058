//! Messages exchanged by the TCP transport, one JSON document per line.

use serde::{Deserialize, Serialize};

use super::{ClientId, LockId, LockStatus, Version};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Acquire {
        client: ClientId,
        lock: LockId,
        version: Version,
    },
    Release {
        client: ClientId,
        lock: LockId,
        version: Version,
    },
    Stat {
        lock: LockId,
    },
    Retry {
        lock: LockId,
        version: Version,
    },
    Revoke {
        lock: LockId,
        version: Version,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Acquire { .. } => "acquire",
            Request::Release { .. } => "release",
            Request::Stat { .. } => "stat",
            Request::Retry { .. } => "retry",
            Request::Revoke { .. } => "revoke",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Status { status: LockStatus },
    Count { count: u64 },
    Ack,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_tagged_by_op() {
        let request = Request::Acquire {
            client: ClientId::new("10.0.0.1:7000"),
            lock: 9,
            version: 2,
        };
        let line = serde_json::to_string(&request).unwrap();
        assert_eq!(
            line,
            r#"{"op":"acquire","client":"10.0.0.1:7000","lock":9,"version":2}"#
        );
    }

    #[test]
    fn status_reply_parses() {
        let reply: Reply = serde_json::from_str(r#"{"reply":"status","status":"retry"}"#).unwrap();
        assert_eq!(
            reply,
            Reply::Status {
                status: LockStatus::Retry
            }
        );
    }
}
