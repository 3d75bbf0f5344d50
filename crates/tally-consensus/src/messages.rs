//! Vote request broadcast to validators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Gossip topic carrying vote requests and vote responses
pub const VALIDATION_TOPIC: &str = "validation";

/// Asks validators to judge an item before `deadline`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub market_data_id: String,
    pub deadline: DateTime<Utc>,
    pub min_votes: usize,
}

impl VoteRequest {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::PeerId;
    use tally_network::{MessageType, NetworkMessage};

    #[test]
    fn test_request_in_envelope() {
        let request = VoteRequest {
            market_data_id: "item-1".into(),
            deadline: Utc::now() + chrono::Duration::seconds(30),
            min_votes: 3,
        };
        assert!(!request.is_expired());

        let msg =
            NetworkMessage::with_body(PeerId::new("node"), MessageType::VoteRequest, &request).unwrap();
        let decoded = NetworkMessage::decode(&msg.encode().unwrap()).unwrap();
        let body: VoteRequest = decoded.body().unwrap();
        assert_eq!(body, request);
    }
}
