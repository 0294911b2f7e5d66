use serde::{Deserialize, Serialize};

// Topics published to subscribers when a block commits
pub const TOPIC_SEND_TRANSACTION: &str = "chain.sendTransaction";
pub const TOPIC_DEPLOY_CONTRACT: &str = "chain.deployContract";
pub const TOPIC_CALL_CONTRACT: &str = "chain.callContract";
pub const TOPIC_DELEGATE: &str = "chain.delegate";
pub const TOPIC_CANDIDATE: &str = "chain.candidate";
pub const TOPIC_LINK_BLOCK: &str = "chain.linkBlock";

// An event attached to a transaction, persisted in the events trie
// and published in-memory once the block commits. Data is JSON.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub data: String,
}

impl Event {
    pub fn new(topic: impl Into<String>, data: impl Into<String>) -> Self {
        Event {
            topic: topic.into(),
            data: data.into(),
        }
    }
}
