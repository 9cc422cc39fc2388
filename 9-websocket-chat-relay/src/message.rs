use serde::{Deserialize, Serialize};
use tracing::warn;

/// Name shown for chat lines when the user does not pick one.
pub const DEFAULT_USER: &str = "匿名";

/// Chat content exchanged between clients through the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    System,
}

/// Server-generated notice, encoded as `{"type":"system","message":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemNotice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub message: String,
}

impl SystemNotice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::System,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Anything a client can receive from the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Inbound {
    System(SystemNotice),
    Chat(ChatMessage),
}

/// Normalizes a text payload received by the hub before fan-out.
///
/// JSON objects are re-encoded in compact form. Everything else is passed
/// through untouched so a misbehaving client never loses its message.
pub fn normalize_payload(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) if value.is_object() => value.to_string(),
        Ok(_) => {
            warn!(payload = raw, "payload is not a JSON object; forwarding as-is");
            raw.to_string()
        }
        Err(error) => {
            warn!(%error, payload = raw, "failed to parse payload; forwarding as-is");
            raw.to_string()
        }
    }
}

/// Decodes one frame's worth of text into an [`Inbound`] message.
pub fn decode_inbound(text: &str) -> serde_json::Result<Inbound> {
    serde_json::from_str(text)
}

/// Decodes a binary frame that wraps UTF-8 JSON text.
pub fn decode_inbound_bytes(bytes: &[u8]) -> anyhow::Result<Inbound> {
    let text = std::str::from_utf8(bytes)?;
    Ok(decode_inbound(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_reencodes_json_objects() {
        let raw = "{ \"user\" : \"alice\",\n \"text\": \"hi\" }";
        let normalized = normalize_payload(raw);
        let parsed: ChatMessage = serde_json::from_str(&normalized).expect("valid chat json");

        assert!(!normalized.contains('\n'));
        assert_eq!(parsed, ChatMessage::new("alice", "hi"));
    }

    #[test]
    fn normalize_passes_garbage_through() {
        assert_eq!(normalize_payload("not json {"), "not json {");
        assert_eq!(normalize_payload("42"), "42");
        assert_eq!(normalize_payload(""), "");
    }

    #[test]
    fn system_notice_wire_shape() {
        let encoded = SystemNotice::new("接続が確立されました")
            .to_json()
            .expect("notice encodes");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("valid json");

        assert_eq!(value["type"], "system");
        assert_eq!(value["message"], "接続が確立されました");
        assert_eq!(
            encoded,
            r#"{"type":"system","message":"接続が確立されました"}"#
        );
    }

    #[test]
    fn decode_distinguishes_notices_from_chat() {
        let notice = decode_inbound(r#"{"type":"system","message":"welcome"}"#).expect("notice");
        assert_eq!(notice, Inbound::System(SystemNotice::new("welcome")));

        let chat = decode_inbound(r#"{"user":"匿名","text":"hello"}"#).expect("chat");
        assert_eq!(chat, Inbound::Chat(ChatMessage::new("匿名", "hello")));
    }

    #[test]
    fn decode_handles_binary_wrapped_text() {
        let bytes = br#"{"user":"bob","text":"from a blob"}"#;
        let chat = decode_inbound_bytes(bytes).expect("binary chat");
        assert_eq!(chat, Inbound::Chat(ChatMessage::new("bob", "from a blob")));

        assert!(decode_inbound_bytes(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_shapes() {
        assert!(decode_inbound("hello there").is_err());
        assert!(decode_inbound(r#"{"type":"other","message":"x"}"#).is_err());
        assert!(decode_inbound(r#"{"user":"no text"}"#).is_err());
    }
}
