use serde::{Deserialize, Serialize};

/// Text frames on the file channel. Binary frames carry raw chunk bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlMessage {
    Start {
        name: String,
        size: u64,
        #[serde(rename = "type", default)]
        mime_type: String,
    },
    Complete {
        /// Hex SHA-256 of the whole file; absent from older peers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
}

impl ControlMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
