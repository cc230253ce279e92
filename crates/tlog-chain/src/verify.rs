//! Batch verification of blocks received from a peer.
//!
//! A batch is accepted only if every block passes, in order:
//! 1. certificate-bearing blocks are signed by the admin;
//! 2. every block verifies against the key table of known active
//!    certificates plus certificates issued within the batch;
//! 3. no block's history, the block itself included, revokes its author.

use ed25519_dalek::VerifyingKey;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{trace, warn};

use crate::block::SignedBlock;
use crate::error::{ChainError, Result};
use crate::hash::Hash;
use crate::ledger::LedgerState;
use crate::transaction::TransactionKind;

/// What a batch is checked against.
pub(crate) struct VerificationContext<'a> {
    pub admin_id: &'a str,
    pub admin_key: VerifyingKey,
    pub ledger: &'a LedgerState,
    pub stored: &'a HashMap<Hash, SignedBlock>,
}

pub(crate) fn verify_batch(
    candidate: &HashMap<Hash, SignedBlock>,
    ctx: &VerificationContext<'_>,
) -> Result<()> {
    check_integrity(candidate)?;
    let issued = check_certificates(candidate, ctx)?;
    check_signatures(candidate, ctx, issued)?;
    check_ancestry(candidate, ctx)?;
    trace!(blocks = candidate.len(), "batch verified");
    Ok(())
}

fn reject(block: &SignedBlock, reason: impl Into<String>) -> ChainError {
    let reason = reason.into();
    warn!(block = %block.hash().short(), author = block.author_id(), %reason, "rejecting batch");
    ChainError::VerificationFailed(format!("block {}: {}", block.hash().short(), reason))
}

/// Map keys must be the blocks' own hashes.
fn check_integrity(candidate: &HashMap<Hash, SignedBlock>) -> Result<()> {
    for (key, block) in candidate {
        if !block.verify_hash(key) {
            return Err(reject(block, format!("filed under foreign hash {}", key.short())));
        }
    }
    Ok(())
}

/// Phase 1: certificates are admin-issued only. Returns the keys they bind.
fn check_certificates(
    candidate: &HashMap<Hash, SignedBlock>,
    ctx: &VerificationContext<'_>,
) -> Result<BTreeMap<String, VerifyingKey>> {
    let mut issued = BTreeMap::new();
    for block in candidate.values() {
        if !block.carries(TransactionKind::Certificate) {
            continue;
        }
        if !block.verify(&ctx.admin_key) {
            return Err(reject(block, "certificate not signed by the admin"));
        }
        for tx in block.transactions() {
            if tx.kind() != TransactionKind::Certificate {
                continue;
            }
            let (user, key) = tx
                .certified_key()
                .ok_or_else(|| reject(block, format!("malformed certificate for {}", tx.content())))?;
            issued.insert(user.to_string(), key);
        }
    }
    Ok(issued)
}

/// Phase 2: every block verifies against its author's key.
fn check_signatures(
    candidate: &HashMap<Hash, SignedBlock>,
    ctx: &VerificationContext<'_>,
    issued: BTreeMap<String, VerifyingKey>,
) -> Result<()> {
    let mut keys = ctx.ledger.active_keys();
    keys.insert(ctx.admin_id.to_string(), ctx.admin_key);
    keys.extend(issued);

    for block in candidate.values() {
        let key = keys
            .get(block.author_id())
            .ok_or_else(|| reject(block, "author has no active certificate"))?;
        if !block.verify(key) {
            return Err(reject(block, "bad signature"));
        }
    }
    Ok(())
}

/// Users revoked somewhere in a block's history, the block included.
type Revoked = Rc<BTreeSet<String>>;

/// Phase 3: no block may sit on a history, itself included, that revokes
/// its author. Revocation sets are memoized per hash, so the stored history
/// is walked once per batch rather than once per block.
fn check_ancestry(candidate: &HashMap<Hash, SignedBlock>, ctx: &VerificationContext<'_>) -> Result<()> {
    let mut memo: HashMap<Hash, Revoked> = HashMap::new();
    for block in candidate.values() {
        let revoked = revoked_through(block, candidate, ctx, &mut memo)?;
        if revoked.contains(block.author_id()) {
            return Err(reject(
                block,
                format!("{} was revoked in its own history", block.author_id()),
            ));
        }
    }
    Ok(())
}

/// Post-order walk from `start`, batch first then storage.
fn revoked_through(
    start: &SignedBlock,
    candidate: &HashMap<Hash, SignedBlock>,
    ctx: &VerificationContext<'_>,
    memo: &mut HashMap<Hash, Revoked>,
) -> Result<Revoked> {
    let root = start.hash();
    let mut stack = vec![(root, false)];

    while let Some((hash, expanded)) = stack.pop() {
        if memo.contains_key(&hash) {
            continue;
        }
        let block = candidate
            .get(&hash)
            .or_else(|| ctx.stored.get(&hash))
            .ok_or_else(|| reject(start, format!("ancestor {} is missing", hash.short())))?;

        if !expanded {
            stack.push((hash, true));
            for parent in block.parent_hashes() {
                if !memo.contains_key(parent) {
                    stack.push((*parent, false));
                }
            }
            continue;
        }

        let own: Vec<&str> = block
            .transactions()
            .iter()
            .filter(|tx| tx.kind() == TransactionKind::RevokeCertificate)
            .map(|tx| tx.content())
            .collect();
        let mut inherited = Vec::with_capacity(block.parent_hashes().len());
        for parent in block.parent_hashes() {
            let set = memo
                .get(parent)
                .ok_or_else(|| reject(start, format!("ancestry of {} is cyclic", hash.short())))?;
            inherited.push(Rc::clone(set));
        }

        let revoked = match (inherited.as_slice(), own.is_empty()) {
            ([], true) => Rc::new(BTreeSet::new()),
            ([only], true) => Rc::clone(only),
            _ => {
                let mut set: BTreeSet<String> = own.iter().map(|user| user.to_string()).collect();
                for parent in &inherited {
                    set.extend(parent.iter().cloned());
                }
                Rc::new(set)
            }
        };
        memo.insert(hash, revoked);
    }

    memo.get(&root)
        .cloned()
        .ok_or_else(|| reject(start, "ancestry walk did not reach the block"))
}
