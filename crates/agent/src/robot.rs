//! Canned replies

use push_core::types::{Message, MessagesReply, PRIVATE_GROUP_ID, TEXT_CONTENT_TYPE};

/// Answer for anything the dictionary does not know
pub const DEFAULT_REPLY: &str = "Love you for ten thousand years!";

const WELCOME: &str = "Dear user, I am at your service!";

/// Look up the reply to a known phrase
pub fn find_reply(msg: &str) -> &'static str {
    match msg {
        "Say something cute to cheer me up" => "Forgot my pills today, feeling adorable",
        "How do I summon you" => "You are already here, master. Leave a rating first, please!",
        "What do you like to do?" => "If money allowed, I would travel everywhere.",
        _ => DEFAULT_REPLY,
    }
}

/// First message of a new session
pub fn welcome() -> MessagesReply {
    MessagesReply {
        msgs: vec![Message {
            msg: serde_json::Value::String(WELCOME.to_string()),
            mid: 0,
            gid: PRIVATE_GROUP_ID,
        }],
        content_type: TEXT_CONTENT_TYPE.to_string(),
    }
}
