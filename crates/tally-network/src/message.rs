//! # Network Messages
//!
//! Envelope for everything published on the validation topic.

use crate::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tally_core::PeerId;

/// Message type identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Ask validators to vote on an item
    VoteRequest,
    /// A validator's vote
    VoteResponse,
}

/// Network message envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// BLAKE3 over sender, timestamp and payload
    pub id: [u8; 32],

    pub message_type: MessageType,

    /// Sender node ID
    pub sender: PeerId,

    /// bincode-encoded body
    pub payload: Vec<u8>,

    /// Unix seconds
    pub timestamp: i64,
}

impl NetworkMessage {
    /// Create new message
    pub fn new(sender: PeerId, message_type: MessageType, payload: Vec<u8>) -> Self {
        let timestamp = chrono::Utc::now().timestamp();

        let mut id_data = sender.as_str().as_bytes().to_vec();
        id_data.extend_from_slice(&timestamp.to_le_bytes());
        id_data.extend_from_slice(&payload);
        let id = *blake3::hash(&id_data).as_bytes();

        Self {
            id,
            message_type,
            sender,
            payload,
            timestamp,
        }
    }

    /// Create a message whose payload is `body` encoded with bincode
    pub fn with_body<T: Serialize>(sender: PeerId, message_type: MessageType, body: &T) -> Result<Self> {
        Ok(Self::new(sender, message_type, bincode::serialize(body)?))
    }

    /// Decode the payload
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Check if message is expired
    pub fn is_expired(&self, max_age_secs: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        now - self.timestamp > max_age_secs
    }

    /// Short hex form of the id for logging
    pub fn short_id(&self) -> String {
        hex::encode(&self.id[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Vote;

    #[test]
    fn test_message_creation() {
        let msg = NetworkMessage::new(PeerId::new("node-1"), MessageType::VoteRequest, vec![1, 2]);
        assert_eq!(msg.sender, PeerId::new("node-1"));
        assert_eq!(msg.message_type, MessageType::VoteRequest);
        assert!(!msg.is_expired(60));
        assert_eq!(msg.short_id().len(), 16);
    }

    #[test]
    fn test_distinct_payloads_distinct_ids() {
        let a = NetworkMessage::new(PeerId::new("n"), MessageType::VoteResponse, vec![1]);
        let b = NetworkMessage::new(PeerId::new("n"), MessageType::VoteResponse, vec![2]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_vote_envelope() {
        let vote = Vote::new("item-9", PeerId::new("validator"), true, 0.7).with_signature(vec![9; 64]);
        let msg = NetworkMessage::with_body(PeerId::new("validator"), MessageType::VoteResponse, &vote).unwrap();
        let decoded = NetworkMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type, MessageType::VoteResponse);
        let body: Vote = decoded.body().unwrap();
        assert_eq!(body, vote);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(NetworkMessage::decode(&[0xff, 0x01]).is_err());
    }
}
