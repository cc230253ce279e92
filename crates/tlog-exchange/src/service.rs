//! The responder half of an exchange: answers the peer's merge requests.

use std::sync::Arc;
use tlog_chain::{Hash, Repository, SignedBlock, SigningIdentity};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::FrameChannel;
use crate::error::{ExchangeError, Result};
use crate::message::{ExchangeMessage, Retrieval};

/// What both sub-protocols of one exchange agree on up front.
#[derive(Clone, Debug)]
pub struct ExchangeContext {
    /// The local signer.
    pub identity: SigningIdentity,
    /// The local root when the exchange lock was taken.
    pub root: SignedBlock,
    /// Local timestamp for this exchange, in milliseconds.
    pub timestamp: i64,
}

impl ExchangeContext {
    /// A witness signed by the local identity at this exchange's timestamp.
    pub fn witness(&self, parents: impl IntoIterator<Item = Hash>) -> SignedBlock {
        self.identity.witness(parents, self.timestamp)
    }
}

/// Item on a sub-protocol's queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(ExchangeMessage),
    /// The peer's merge is done; no more requests will come.
    Stop,
    /// The exchange is being torn down.
    Interrupted,
}

pub struct ServiceProtocol {
    repository: Arc<Repository>,
    context: Arc<ExchangeContext>,
}

impl ServiceProtocol {
    pub fn new(repository: Arc<Repository>, context: Arc<ExchangeContext>) -> Self {
        Self {
            repository,
            context,
        }
    }

    /// Answer one request. Returns `None` for anything that is not a request.
    ///
    /// The root and timestamp come from the exchange snapshot so both peers
    /// reason about the same frontier even after one of them commits.
    pub fn handle(&self, request: &ExchangeMessage) -> Option<ExchangeMessage> {
        let response = match request {
            ExchangeMessage::GetRootBlockRequest => {
                ExchangeMessage::GetRootBlockResponse(Retrieval::Found(self.context.root.clone()))
            }
            ExchangeMessage::GetBlocksRequest { hashes } => match self.repository.get_blocks(hashes) {
                Ok(blocks) => ExchangeMessage::GetBlocksResponse(Retrieval::Found(blocks)),
                Err(e) => {
                    debug!(requested = hashes.len(), error = %e, "cannot serve blocks");
                    ExchangeMessage::GetBlocksResponse(Retrieval::FailedToRetrieve)
                }
            },
            ExchangeMessage::GetProofOfWitnessRequest { parent_hashes } => {
                ExchangeMessage::GetProofOfWitnessResponse {
                    block: self.context.witness(parent_hashes.iter().copied()),
                }
            }
            ExchangeMessage::GetTimestampRequest => ExchangeMessage::GetTimestampResponse {
                timestamp: self.context.timestamp,
            },
            _ => return None,
        };
        Some(response)
    }

    /// Serve requests until told to stop. Returns how many were answered.
    pub(crate) async fn run(
        self,
        channel: Arc<dyn FrameChannel>,
        mut requests: mpsc::Receiver<Delivery>,
    ) -> Result<usize> {
        let mut served = 0;
        loop {
            match requests.recv().await {
                Some(Delivery::Message(request)) => {
                    let Some(response) = self.handle(&request) else {
                        trace!(message = request.name(), "service ignoring non-request");
                        continue;
                    };
                    trace!(request = request.name(), "answering");
                    channel.send(response.encode()?).await?;
                    served += 1;
                }
                Some(Delivery::Stop) => {
                    debug!(served, "service finished");
                    return Ok(served);
                }
                Some(Delivery::Interrupted) | None => {
                    return Err(ExchangeError::terminated("service interrupted"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use tlog_chain::{MemoryCredentialStore, Transaction, TransactionKind};

    fn setup() -> (Arc<Repository>, ServiceProtocol) {
        let admin = SigningIdentity::new("ca", "Origin", SigningKey::from_bytes(&[1; 32]));
        let alice = SigningIdentity::new("alice", "ward", SigningKey::from_bytes(&[2; 32]));
        let credentials = MemoryCredentialStore::new("ca", admin.public_key());
        let repo = Arc::new(Repository::in_memory(Arc::new(credentials)));
        repo.bootstrap(admin.genesis([alice.certificate()])).unwrap();
        repo.add_user_block(vec![Transaction::record_request("r", "")], &alice)
            .unwrap();
        let context = Arc::new(ExchangeContext {
            identity: alice,
            root: repo.get_root().unwrap(),
            timestamp: 1234,
        });
        (repo.clone(), ServiceProtocol::new(repo, context))
    }

    #[test]
    fn answers_from_snapshot() {
        let (repo, service) = setup();
        let root = repo.get_root().unwrap();

        assert_eq!(
            service.handle(&ExchangeMessage::GetRootBlockRequest),
            Some(ExchangeMessage::GetRootBlockResponse(Retrieval::Found(root.clone())))
        );
        assert_eq!(
            service.handle(&ExchangeMessage::GetTimestampRequest),
            Some(ExchangeMessage::GetTimestampResponse { timestamp: 1234 })
        );
        assert_eq!(service.handle(&ExchangeMessage::MergeComplete), None);
    }

    #[test]
    fn blocks_are_served_in_order_or_not_at_all() {
        let (repo, service) = setup();
        let root = repo.get_root().unwrap();
        let genesis = root.parent_hashes()[0];

        let request = ExchangeMessage::GetBlocksRequest {
            hashes: vec![genesis, root.hash()],
        };
        let Some(ExchangeMessage::GetBlocksResponse(Retrieval::Found(blocks))) = service.handle(&request) else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.iter().map(|b| b.hash()).collect::<Vec<_>>(), vec![genesis, root.hash()]);

        let unknown = tlog_chain::Hasher::hash(b"nope");
        let request = ExchangeMessage::GetBlocksRequest {
            hashes: vec![genesis, unknown],
        };
        assert_eq!(
            service.handle(&request),
            Some(ExchangeMessage::GetBlocksResponse(Retrieval::FailedToRetrieve))
        );
    }

    #[test]
    fn signs_witness_on_demand() {
        let (repo, service) = setup();
        let root = repo.root_hash().unwrap();
        let Some(ExchangeMessage::GetProofOfWitnessResponse { block }) =
            service.handle(&ExchangeMessage::GetProofOfWitnessRequest {
                parent_hashes: vec![root],
            })
        else {
            panic!("expected a witness");
        };
        assert_eq!(block.parent_hashes(), &[root]);
        assert_eq!(block.author_id(), "alice");
        assert_eq!(block.timestamp(), 1234);
        assert!(block.carries(TransactionKind::ProofOfWitness));
        // Signing is deterministic, so asking twice yields the same block.
        let again = service.handle(&ExchangeMessage::GetProofOfWitnessRequest {
            parent_hashes: vec![root],
        });
        assert_eq!(again, Some(ExchangeMessage::GetProofOfWitnessResponse { block }));
    }
}
