use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct ChatMessage {
    pub content: String,
    pub owner: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewChatMessage {
    pub content: String,
    pub username: String,
}
