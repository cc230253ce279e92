//! Application state derived from the transactions in the log.
//!
//! [`LedgerState`] is a join-semilattice: folding the same blocks in any
//! order, or folding a block twice, yields the same state. Certificates
//! live in a two-phase set so a revoked user stays revoked.

use ed25519_dalek::VerifyingKey;
use std::collections::BTreeMap;
use tlog_core::{GSet, Lattice, TwoPhaseSet};

use crate::block::SignedBlock;
use crate::credentials::{public_key_from_hex, public_key_hex};
use crate::hash::Hash;
use crate::transaction::TransactionKind;

/// Certificate lineage and witness index for a set of blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerState {
    certificates: TwoPhaseSet<String>,
    public_keys: BTreeMap<String, String>,
    witnesses: GSet<Hash>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state contributed by `blocks` alone.
    pub fn from_blocks<'a>(blocks: impl IntoIterator<Item = &'a SignedBlock>) -> Self {
        let mut state = Self::new();
        for block in blocks {
            state.absorb(block);
        }
        state
    }

    /// Fold one block's transactions into the state.
    pub fn absorb(&mut self, block: &SignedBlock) {
        for tx in block.transactions() {
            match tx.kind() {
                TransactionKind::Certificate => {
                    if let Some((user, key)) = tx.certified_key() {
                        self.certificates.add(user.to_string());
                        self.record_key(user, public_key_hex(&key));
                    }
                }
                TransactionKind::RevokeCertificate => {
                    self.certificates.remove(tx.content().to_string());
                }
                TransactionKind::ProofOfWitness => {
                    self.witnesses.insert(block.hash());
                }
                TransactionKind::RecordRequest | TransactionKind::RecordAccess => {}
            }
        }
    }

    // Greatest key wins so that join stays commutative.
    fn record_key(&mut self, user: &str, key_hex: String) {
        match self.public_keys.get(user) {
            Some(existing) if *existing >= key_hex => {}
            _ => {
                self.public_keys.insert(user.to_string(), key_hex);
            }
        }
    }

    /// Whether `user` holds a certificate that has not been revoked.
    pub fn is_active(&self, user: &str) -> bool {
        self.certificates.contains(&user.to_string())
    }

    pub fn is_revoked(&self, user: &str) -> bool {
        self.certificates.is_removed(&user.to_string())
    }

    /// The certified key of an active user.
    pub fn active_key(&self, user: &str) -> Option<VerifyingKey> {
        if !self.is_active(user) {
            return None;
        }
        self.public_keys
            .get(user)
            .and_then(|hex| public_key_from_hex(hex).ok())
    }

    /// All active users with their keys.
    pub fn active_keys(&self) -> BTreeMap<String, VerifyingKey> {
        self.certificates
            .iter()
            .filter_map(|user| Some((user.clone(), self.active_key(user)?)))
            .collect()
    }

    pub fn active_users(&self) -> impl Iterator<Item = &String> {
        self.certificates.iter()
    }

    /// Hashes of every proof-of-witness block seen.
    pub fn witness_blocks(&self) -> impl Iterator<Item = &Hash> {
        self.witnesses.iter()
    }

    pub fn is_witness(&self, hash: &Hash) -> bool {
        self.witnesses.contains(hash)
    }
}

impl Lattice for LedgerState {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = Self {
            certificates: self.certificates.join(&other.certificates),
            public_keys: self.public_keys.clone(),
            witnesses: self.witnesses.join(&other.witnesses),
        };
        for (user, key) in &other.public_keys {
            joined.record_key(user, key.clone());
        }
        joined
    }
}

/// Application-state processor notified of every newly stored block.
pub trait TransactionObserver: Send + Sync {
    fn observe(&self, block: &SignedBlock);
}
