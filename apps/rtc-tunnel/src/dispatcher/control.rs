use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// The receiver's buffer for `label` is full; stop sending on it.
    Full,
    /// The receiver drained its buffer; sending may resume.
    Empty,
}

/// Flow-control frame carried as JSON text on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    pub label: String,
}

impl ControlMessage {
    pub fn new(kind: ControlKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let text = ControlMessage::new(ControlKind::Full, "10.0.0.1:5000")
            .encode()
            .expect("encode");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "full");
        assert_eq!(value["label"], "10.0.0.1:5000");
    }

    #[test]
    fn decodes_empty_frames() {
        let message =
            ControlMessage::decode(br#"{"label":"s1","type":"empty"}"#).expect("decode");
        assert_eq!(message, ControlMessage::new(ControlKind::Empty, "s1"));
    }

    #[test]
    fn rejects_unknown_kinds() {
        assert!(ControlMessage::decode(br#"{"label":"s1","type":"half"}"#).is_err());
    }
}
