//! The requesting half of an exchange: pulls the peer's history and
//! reconciles it with the local one.
//!
//! Both peers run this concurrently against each other. Every decision is
//! a function of the two exchange snapshots `(root, timestamp)`, and
//! signing is deterministic, so both sides build byte-identical witness
//! blocks and land on the same root.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tlog_chain::{Hash, Repository, SignedBlock, TransactionKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::FrameChannel;
use crate::error::{ExchangeError, Result};
use crate::message::{ExchangeMessage, Retrieval};
use crate::service::{Delivery, ExchangeContext};

/// How the two histories related.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Both roots were already equal. Nothing changed.
    AlreadyMerged,
    /// The local root was an ancestor of the remote one. The peer's
    /// witness over its own root became the new root.
    FastForward,
    /// The remote root was already stored locally. A local witness over
    /// the local root became the new root.
    Absorbed,
    /// The roots were concurrent and two chained witnesses joined them.
    Reconciled,
}

/// Result of one merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    pub new_root: Hash,
    /// Blocks newly stored by this merge.
    pub blocks_added: usize,
}

/// Blocks reachable from the remote root that are not stored locally.
struct Closure {
    blocks: HashMap<Hash, SignedBlock>,
    seen_local_root: bool,
}

pub(crate) struct MergeProtocol {
    repository: Arc<Repository>,
    context: Arc<ExchangeContext>,
    channel: Arc<dyn FrameChannel>,
    round_trip_timeout: Duration,
}

impl MergeProtocol {
    pub(crate) fn new(
        repository: Arc<Repository>,
        context: Arc<ExchangeContext>,
        channel: Arc<dyn FrameChannel>,
        round_trip_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            context,
            channel,
            round_trip_timeout,
        }
    }

    pub(crate) async fn run(self, mut responses: mpsc::Receiver<Delivery>) -> Result<MergeReport> {
        let local_root = self.context.root.hash();
        let remote_root = self.fetch_root(&mut responses).await?;
        let remote_hash = remote_root.hash();

        if remote_hash == local_root {
            debug!(root = %local_root.short(), "histories already identical");
            return Ok(MergeReport {
                outcome: MergeOutcome::AlreadyMerged,
                new_root: local_root,
                blocks_added: 0,
            });
        }

        let (outcome, candidate, new_root) = if self.repository.contains(&remote_hash) {
            let witness = self.context.witness([local_root]);
            let new_root = witness.hash();
            (MergeOutcome::Absorbed, batch([witness]), new_root)
        } else {
            let closure = self.collect_closure(remote_root, &mut responses).await?;
            let mut candidate = closure.blocks;
            if closure.seen_local_root {
                let witness = self.fetch_witness(vec![remote_hash], &mut responses).await?;
                let new_root = witness.hash();
                candidate.insert(new_root, witness);
                (MergeOutcome::FastForward, candidate, new_root)
            } else {
                let remote_timestamp = self.fetch_timestamp(&mut responses).await?;
                let (first, second) = self
                    .chain_witnesses(remote_hash, remote_timestamp, &mut responses)
                    .await?;
                let new_root = second.hash();
                candidate.insert(first.hash(), first);
                candidate.insert(new_root, second);
                (MergeOutcome::Reconciled, candidate, new_root)
            }
        };

        self.repository.verify_blocks(&candidate)?;
        let blocks_added = self.repository.update_chain(candidate.into_values(), new_root)?;
        info!(?outcome, root = %new_root.short(), blocks_added, "merge committed");
        Ok(MergeReport {
            outcome,
            new_root,
            blocks_added,
        })
    }

    /// Order the two sides by `(timestamp, root hash)`. The earlier side's
    /// witness names both roots; the later side's names the earlier witness.
    async fn chain_witnesses(
        &self,
        remote_root: Hash,
        remote_timestamp: i64,
        responses: &mut mpsc::Receiver<Delivery>,
    ) -> Result<(SignedBlock, SignedBlock)> {
        let local_root = self.context.root.hash();
        let mut frontier = vec![local_root, remote_root];
        frontier.sort();

        let local_first = (self.context.timestamp, local_root) < (remote_timestamp, remote_root);
        debug!(
            local_ts = self.context.timestamp,
            remote_ts = remote_timestamp,
            local_first,
            "reconciling concurrent roots"
        );
        if local_first {
            let first = self.context.witness(frontier);
            let second = self.fetch_witness(vec![first.hash()], responses).await?;
            Ok((first, second))
        } else {
            let first = self.fetch_witness(frontier, responses).await?;
            let second = self.context.witness([first.hash()]);
            Ok((first, second))
        }
    }

    /// Walk parents from the remote root, one batched fetch per layer,
    /// stopping at anything already stored.
    async fn collect_closure(
        &self,
        remote_root: SignedBlock,
        responses: &mut mpsc::Receiver<Delivery>,
    ) -> Result<Closure> {
        let local_root = self.context.root.hash();
        let mut seen_local_root = false;
        let mut layer = vec![remote_root.hash()];
        let mut blocks = batch([remote_root]);

        loop {
            let mut wanted = Vec::new();
            let mut scheduled = HashSet::new();
            for hash in &layer {
                let Some(block) = blocks.get(hash) else {
                    continue;
                };
                for parent in block.parent_hashes() {
                    if *parent == local_root {
                        seen_local_root = true;
                    }
                    if blocks.contains_key(parent)
                        || self.repository.contains(parent)
                        || !scheduled.insert(*parent)
                    {
                        continue;
                    }
                    wanted.push(*parent);
                }
            }
            if wanted.is_empty() {
                break;
            }
            debug!(count = wanted.len(), "fetching ancestor layer");
            for block in self.fetch_blocks(&wanted, responses).await? {
                blocks.insert(block.hash(), block);
            }
            layer = wanted;
        }
        debug!(blocks = blocks.len(), seen_local_root, "closure complete");
        Ok(Closure {
            blocks,
            seen_local_root,
        })
    }

    async fn fetch_root(&self, responses: &mut mpsc::Receiver<Delivery>) -> Result<SignedBlock> {
        match self.request(ExchangeMessage::GetRootBlockRequest, responses).await? {
            ExchangeMessage::GetRootBlockResponse(Retrieval::Found(block)) => Ok(block),
            ExchangeMessage::GetRootBlockResponse(Retrieval::FailedToRetrieve) => {
                Err(ExchangeError::terminated("peer has no root block"))
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_blocks(
        &self,
        hashes: &[Hash],
        responses: &mut mpsc::Receiver<Delivery>,
    ) -> Result<Vec<SignedBlock>> {
        let request = ExchangeMessage::GetBlocksRequest {
            hashes: hashes.to_vec(),
        };
        let blocks = match self.request(request, responses).await? {
            ExchangeMessage::GetBlocksResponse(Retrieval::Found(blocks)) => blocks,
            ExchangeMessage::GetBlocksResponse(Retrieval::FailedToRetrieve) => {
                return Err(ExchangeError::terminated(format!(
                    "peer could not supply {} requested blocks",
                    hashes.len()
                )))
            }
            other => return Err(unexpected(&other)),
        };
        let returned: Vec<Hash> = blocks.iter().map(SignedBlock::hash).collect();
        if returned != hashes {
            return Err(ExchangeError::terminated(format!(
                "peer answered {} blocks that do not match the {} requested",
                returned.len(),
                hashes.len()
            )));
        }
        Ok(blocks)
    }

    async fn fetch_witness(
        &self,
        parents: Vec<Hash>,
        responses: &mut mpsc::Receiver<Delivery>,
    ) -> Result<SignedBlock> {
        let request = ExchangeMessage::GetProofOfWitnessRequest {
            parent_hashes: parents.clone(),
        };
        let block = match self.request(request, responses).await? {
            ExchangeMessage::GetProofOfWitnessResponse { block } => block,
            other => return Err(unexpected(&other)),
        };
        let requested: HashSet<&Hash> = parents.iter().collect();
        let named: HashSet<&Hash> = block.parent_hashes().iter().collect();
        if requested != named || !block.carries(TransactionKind::ProofOfWitness) {
            return Err(ExchangeError::terminated("peer returned a malformed witness"));
        }
        Ok(block)
    }

    async fn fetch_timestamp(&self, responses: &mut mpsc::Receiver<Delivery>) -> Result<i64> {
        match self.request(ExchangeMessage::GetTimestampRequest, responses).await? {
            ExchangeMessage::GetTimestampResponse { timestamp } => Ok(timestamp),
            other => Err(unexpected(&other)),
        }
    }

    /// One round trip, send included. The next response on the queue must
    /// answer it.
    async fn request(
        &self,
        request: ExchangeMessage,
        responses: &mut mpsc::Receiver<Delivery>,
    ) -> Result<ExchangeMessage> {
        let frame = request.encode()?;
        let round_trip = async {
            self.channel.send(frame).await?;
            Ok::<_, ExchangeError>(responses.recv().await)
        };
        match tokio::time::timeout(self.round_trip_timeout, round_trip).await {
            Ok(Ok(Some(Delivery::Message(response)))) => Ok(response),
            Ok(Ok(Some(Delivery::Stop))) | Ok(Ok(Some(Delivery::Interrupted))) | Ok(Ok(None)) => Err(
                ExchangeError::terminated(format!("interrupted while awaiting {}", request.name())),
            ),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExchangeError::terminated(format!(
                "no answer to {} within {:?}",
                request.name(),
                self.round_trip_timeout
            ))),
        }
    }
}

fn batch(blocks: impl IntoIterator<Item = SignedBlock>) -> HashMap<Hash, SignedBlock> {
    blocks.into_iter().map(|b| (b.hash(), b)).collect()
}

fn unexpected(message: &ExchangeMessage) -> ExchangeError {
    ExchangeError::terminated(format!("unexpected {}", message.name()))
}
