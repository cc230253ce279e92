//! Wire messages exchanged during a merge.
//!
//! Each frame is one version byte followed by a postcard-encoded
//! [`ExchangeMessage`]. Blocks travel as body plus signature; receivers
//! re-derive hashes.

use serde::{Deserialize, Serialize};
use tlog_chain::{Hash, SignedBlock};

use crate::error::{ExchangeError, Result};

/// Version byte prefixed to every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Outcome of a lookup on the answering side. Distinguishes "the peer
/// does not have it" from a broken connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retrieval<T> {
    Found(T),
    FailedToRetrieve,
}

impl<T> Retrieval<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Retrieval::Found(value) => Some(value),
            Retrieval::FailedToRetrieve => None,
        }
    }
}

/// How the dispatcher routes a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Answered by the local service.
    Request,
    /// Consumed by the local merge.
    Response,
    /// Handled by the dispatcher itself.
    Control,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeMessage {
    GetRootBlockRequest,
    GetRootBlockResponse(Retrieval<SignedBlock>),

    /// Fetch blocks by hash. The response preserves request order.
    GetBlocksRequest { hashes: Vec<Hash> },
    GetBlocksResponse(Retrieval<Vec<SignedBlock>>),

    /// Ask the peer to sign a fresh witness naming these parents.
    GetProofOfWitnessRequest { parent_hashes: Vec<Hash> },
    GetProofOfWitnessResponse { block: SignedBlock },

    GetTimestampRequest,
    GetTimestampResponse { timestamp: i64 },

    /// The sender's merge has finished.
    MergeComplete,
    MergeCompleteAck,
    /// The sender is abandoning the exchange.
    MergeInterrupted,
}

impl ExchangeMessage {
    pub fn kind(&self) -> MessageKind {
        use ExchangeMessage::*;
        match self {
            GetRootBlockRequest
            | GetBlocksRequest { .. }
            | GetProofOfWitnessRequest { .. }
            | GetTimestampRequest => MessageKind::Request,
            GetRootBlockResponse(_)
            | GetBlocksResponse(_)
            | GetProofOfWitnessResponse { .. }
            | GetTimestampResponse { .. } => MessageKind::Response,
            MergeComplete | MergeCompleteAck | MergeInterrupted => MessageKind::Control,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        use ExchangeMessage::*;
        match self {
            GetRootBlockRequest => "get-root-block-request",
            GetRootBlockResponse(_) => "get-root-block-response",
            GetBlocksRequest { .. } => "get-blocks-request",
            GetBlocksResponse(_) => "get-blocks-response",
            GetProofOfWitnessRequest { .. } => "get-proof-of-witness-request",
            GetProofOfWitnessResponse { .. } => "get-proof-of-witness-response",
            GetTimestampRequest => "get-timestamp-request",
            GetTimestampResponse { .. } => "get-timestamp-response",
            MergeComplete => "merge-complete",
            MergeCompleteAck => "merge-complete-ack",
            MergeInterrupted => "merge-interrupted",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut frame = vec![PROTOCOL_VERSION];
        frame.extend(postcard::to_allocvec(self)?);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        match frame.split_first() {
            Some((&PROTOCOL_VERSION, body)) => Ok(postcard::from_bytes(body)?),
            Some((version, _)) => Err(ExchangeError::Codec(format!(
                "unsupported protocol version {}",
                version
            ))),
            None => Err(ExchangeError::Codec("empty frame".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use tlog_chain::{SigningIdentity, Transaction};

    fn block() -> SignedBlock {
        let id = SigningIdentity::new("alice", "lab", SigningKey::from_bytes(&[2; 32]));
        id.issue([], [Transaction::record_request("chart-7", "audit")], 7)
    }

    #[test]
    fn kinds_route_as_expected() {
        assert_eq!(ExchangeMessage::GetTimestampRequest.kind(), MessageKind::Request);
        assert_eq!(
            ExchangeMessage::GetBlocksResponse(Retrieval::FailedToRetrieve).kind(),
            MessageKind::Response
        );
        assert_eq!(ExchangeMessage::MergeInterrupted.kind(), MessageKind::Control);
    }

    #[test]
    fn blocks_survive_the_wire() {
        let original = block();
        let message = ExchangeMessage::GetBlocksResponse(Retrieval::Found(vec![original.clone()]));
        let decoded = ExchangeMessage::decode(&message.encode().unwrap()).unwrap();
        let ExchangeMessage::GetBlocksResponse(Retrieval::Found(blocks)) = decoded else {
            panic!("wrong message: {:?}", decoded);
        };
        assert_eq!(blocks[0].hash(), original.hash());
        assert!(blocks[0].verify(&SigningKey::from_bytes(&[2; 32]).verifying_key()));
    }

    #[test]
    fn rejects_unknown_version_and_garbage() {
        let mut frame = ExchangeMessage::MergeComplete.encode().unwrap();
        frame[0] = 9;
        assert!(matches!(ExchangeMessage::decode(&frame), Err(ExchangeError::Codec(_))));
        assert!(ExchangeMessage::decode(&[]).is_err());
        assert!(ExchangeMessage::decode(&[PROTOCOL_VERSION, 0xff, 0xff]).is_err());
    }

    #[test]
    fn retrieval_into_option() {
        assert_eq!(Retrieval::Found(3).into_option(), Some(3));
        assert_eq!(Retrieval::<u8>::FailedToRetrieve.into_option(), None);
    }
}
