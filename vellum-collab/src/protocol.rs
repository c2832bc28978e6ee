//! Binary sync protocol between replicas.
//!
//! Wire format (inside one binary WebSocket frame — the frame itself is
//! the length prefix):
//!
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ msg kind │ payload                      │
//! │ 1 byte   │ variable (bincode-encoded)   │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! Message kinds:
//! - `SyncStep1` — a replica announces its state vector.
//! - `SyncStep2` — the reply, carrying exactly the missing updates.
//! - `Update` — broadcast of a freshly produced delta.
//! - `Awareness` — transient presence payload, never persisted.
//!
//! This layout is a stable contract for client compatibility:
//! `decode(encode(m)) == m` holds for every message kind.

/// Message kind tags. The tag is the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SyncStep1 = 1,
    SyncStep2 = 2,
    Update = 3,
    Awareness = 4,
}

impl MessageType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageType::SyncStep1),
            2 => Some(MessageType::SyncStep2),
            3 => Some(MessageType::Update),
            4 => Some(MessageType::Awareness),
            _ => None,
        }
    }
}

/// A decoded protocol message.
///
/// Payload bytes are the encoded forms of [`crate::crdt::StateVector`],
/// [`crate::crdt::UpdateFragment`] or [`crate::awareness::AwarenessUpdate`];
/// this layer only frames them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Announce what the sender already has.
    SyncStep1 { state_vector: Vec<u8> },
    /// Reply with exactly the updates the peer was missing.
    SyncStep2 { update: Vec<u8> },
    /// Broadcast a new local or merged delta.
    Update { update: Vec<u8> },
    /// Ephemeral presence state; last-writer-wins per client.
    Awareness { update: Vec<u8> },
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            SyncMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            SyncMessage::Update { .. } => MessageType::Update,
            SyncMessage::Awareness { .. } => MessageType::Awareness,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::SyncStep1 { state_vector } => state_vector,
            SyncMessage::SyncStep2 { update }
            | SyncMessage::Update { update }
            | SyncMessage::Awareness { update } => update,
        }
    }

    /// Serialize to the binary wire form.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(self.message_type() as u8);
        out.extend_from_slice(payload);
        out
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;
        let payload = payload.to_vec();
        Ok(match kind {
            MessageType::SyncStep1 => SyncMessage::SyncStep1 { state_vector: payload },
            MessageType::SyncStep2 => SyncMessage::SyncStep2 { update: payload },
            MessageType::Update => SyncMessage::Update { update: payload },
            MessageType::Awareness => SyncMessage::Awareness { update: payload },
        })
    }
}

/// Protocol errors. Local to one connection: the offending connection is
/// closed, the document session and other connections are unaffected.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Zero-length frame.
    EmptyFrame,
    /// Unrecognized message kind tag.
    UnknownMessageType(u8),
    /// The payload could not be decoded or failed validation.
    InvalidPayload(String),
    /// The transport closed underneath us.
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::EmptyFrame => write!(f, "empty frame"),
            ProtocolError::UnknownMessageType(tag) => {
                write!(f, "unknown message type tag {tag}")
            }
            ProtocolError::InvalidPayload(e) => write!(f, "invalid payload: {e}"),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ItemId, StateVector, UpdateFragment};

    #[test]
    fn test_sync_step1_roundtrip() {
        let mut sv = StateVector::new();
        sv.observe(ItemId::new(4, 9));
        let msg = SyncMessage::SyncStep1 { state_vector: sv.encode().unwrap() };

        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);

        if let SyncMessage::SyncStep1 { state_vector } = decoded {
            assert_eq!(StateVector::decode(&state_vector).unwrap(), sv);
        } else {
            panic!("wrong kind");
        }
    }

    #[test]
    fn test_sync_step2_roundtrip() {
        let msg = SyncMessage::SyncStep2 { update: vec![9, 8, 7] };
        assert_eq!(SyncMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_update_roundtrip() {
        let frag = UpdateFragment::default();
        let msg = SyncMessage::Update { update: frag.encode().unwrap() };
        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let msg = SyncMessage::Awareness { update: vec![1, 2, 3, 4] };
        assert_eq!(SyncMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let msg = SyncMessage::Update { update: Vec::new() };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 1);
        assert_eq!(SyncMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_tag_values_stable() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(matches!(
            SyncMessage::decode(&[]),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn test_decode_unknown_tag() {
        assert!(matches!(
            SyncMessage::decode(&[0xAB, 1, 2]),
            Err(ProtocolError::UnknownMessageType(0xAB))
        ));
    }

    #[test]
    fn test_large_update_roundtrip() {
        let msg = SyncMessage::Update { update: vec![42u8; 65536] };
        let decoded = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_display() {
        assert!(ProtocolError::EmptyFrame.to_string().contains("empty"));
        assert!(ProtocolError::UnknownMessageType(7).to_string().contains('7'));
        assert!(ProtocolError::InvalidPayload("bad".into()).to_string().contains("bad"));
    }
}
