//! Decrypted payload shapes: discovery announcements and sender-tagged text.

use crate::identity::{DeviceId, DeviceInfo, IdentityError, DISCOVERY_MARKER, FIELD_SEPARATOR};

/// A sender prefix is only recognised when the first separator sits before this offset.
/// Device ids are at most 16 characters.
pub const MAX_SENDER_PREFIX: usize = 20;

/// A decrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Identity announcement (`DEV|...`). Never delivered as text.
    Discovery(DeviceInfo),
    /// User text, tagged `<device_id>|` by the sender when the prefix is present.
    Text {
        sender: Option<DeviceId>,
        body: String,
    },
}

impl Payload {
    /// Classify a decrypted payload. Fails only for a discovery payload that does not parse.
    pub fn parse(plaintext: &str) -> Result<Self, IdentityError> {
        if plaintext.starts_with(DISCOVERY_MARKER) {
            return DeviceInfo::from_compact_string(plaintext).map(Payload::Discovery);
        }
        match plaintext.find(FIELD_SEPARATOR) {
            Some(i) if i > 0 && i < MAX_SENDER_PREFIX => Ok(Payload::Text {
                sender: Some(DeviceId::new(&plaintext[..i])),
                body: plaintext[i + 1..].to_string(),
            }),
            _ => Ok(Payload::Text {
                sender: None,
                body: plaintext.to_string(),
            }),
        }
    }
}

/// Tag outgoing text with the local id: `<device_id>|<text>`.
pub fn text_payload(local_id: &DeviceId, text: &str) -> String {
    format!("{local_id}{FIELD_SEPARATOR}{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_text() {
        let id = DeviceId::new("AAAA");
        let payload = text_payload(&id, "hello");
        assert_eq!(payload, "AAAA|hello");
        assert_eq!(
            Payload::parse(&payload).unwrap(),
            Payload::Text {
                sender: Some(id),
                body: "hello".into()
            }
        );
    }

    #[test]
    fn body_keeps_later_separators() {
        assert_eq!(
            Payload::parse("AAAA|a|b|c").unwrap(),
            Payload::Text {
                sender: Some(DeviceId::new("AAAA")),
                body: "a|b|c".into()
            }
        );
    }

    #[test]
    fn untagged_text() {
        for raw in ["plain text", "|leading separator", "a very long first word here|x"] {
            assert_eq!(
                Payload::parse(raw).unwrap(),
                Payload::Text {
                    sender: None,
                    body: raw.into()
                }
            );
        }
    }

    #[test]
    fn discovery() {
        let parsed =
            Payload::parse("DEV|XYZ1|HOST1|alice|Linux|AA-BB-CC-DD-EE-FF|10.0.0.5").unwrap();
        match parsed {
            Payload::Discovery(info) => assert_eq!(info.device_id.as_str(), "XYZ1"),
            other => panic!("expected discovery, got {other:?}"),
        }
    }

    #[test]
    fn malformed_discovery_is_error() {
        assert!(Payload::parse("DEV|XYZ1").is_err());
    }
}
