//! The block repository: storage, root pointer, verification and commits.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tlog_core::Lattice;
use tracing::{debug, info};

use crate::block::SignedBlock;
use crate::credentials::{CredentialStore, SigningIdentity};
use crate::error::{ChainError, Result};
use crate::hash::Hash;
use crate::ledger::{LedgerState, TransactionObserver};
use crate::lock::{ExchangeGuard, ExchangeLock};
use crate::store::{BlobStore, MemoryBlobStore, ROOT_KEY};
use crate::transaction::Transaction;
use crate::verify::{verify_batch, VerificationContext};

#[derive(Default)]
struct ChainState {
    blocks: HashMap<Hash, SignedBlock>,
    root: Option<Hash>,
    ledger: LedgerState,
}

/// Owns the local block DAG and its root pointer.
///
/// Every read and commit is individually atomic under an internal lock.
/// Multi-step sequences (a merge, a local write) additionally hold the
/// exchange lock from [`Repository::begin_exchange`].
pub struct Repository {
    store: Arc<dyn BlobStore>,
    credentials: Arc<dyn CredentialStore>,
    state: RwLock<ChainState>,
    exchange: Arc<ExchangeLock>,
    observers: RwLock<Vec<Arc<dyn TransactionObserver>>>,
}

impl Repository {
    /// Open a repository over `store`, loading everything reachable from
    /// the persisted root.
    pub fn open(store: Arc<dyn BlobStore>, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let state = load_state(store.as_ref())?;
        Ok(Self {
            store,
            credentials,
            state: RwLock::new(state),
            exchange: Arc::new(ExchangeLock::default()),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// An empty repository over a fresh in-memory store.
    pub fn in_memory(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            store: Arc::new(MemoryBlobStore::new()),
            credentials,
            state: RwLock::new(ChainState::default()),
            exchange: Arc::new(ExchangeLock::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Install `genesis` as the root of an empty repository.
    pub fn bootstrap(&self, genesis: SignedBlock) -> Result<()> {
        let _guard = self.begin_exchange();
        let mut state = self.state.write();
        if state.root.is_some() {
            return Err(ChainError::AlreadyBootstrapped);
        }
        if !genesis.is_genesis() {
            return Err(ChainError::VerificationFailed("genesis block has parents".into()));
        }
        if genesis.author_id() != self.credentials.admin_id()
            || !genesis.verify(&self.credentials.admin_public_key())
        {
            return Err(ChainError::VerificationFailed(
                "genesis block is not signed by the admin".into(),
            ));
        }
        let root = genesis.hash();
        let added = self.commit(&mut state, vec![genesis], root)?;
        drop(state);
        info!(root = %root.short(), "bootstrapped repository");
        self.notify(&added);
        Ok(())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.read().blocks.contains_key(hash)
    }

    pub fn get_block(&self, hash: &Hash) -> Option<SignedBlock> {
        self.state.read().blocks.get(hash).cloned()
    }

    /// Fetch blocks in the order requested. Fails on the first missing hash.
    pub fn get_blocks(&self, hashes: &[Hash]) -> Result<Vec<SignedBlock>> {
        let state = self.state.read();
        hashes
            .iter()
            .map(|hash| {
                state
                    .blocks
                    .get(hash)
                    .cloned()
                    .ok_or(ChainError::NotFound(*hash))
            })
            .collect()
    }

    pub fn get_root(&self) -> Result<SignedBlock> {
        let state = self.state.read();
        let root = state.root.ok_or(ChainError::NotBootstrapped)?;
        state
            .blocks
            .get(&root)
            .cloned()
            .ok_or(ChainError::NotFound(root))
    }

    pub fn root_hash(&self) -> Option<Hash> {
        self.state.read().root
    }

    pub fn len(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().blocks.is_empty()
    }

    pub fn admin_id(&self) -> &str {
        self.credentials.admin_id()
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Whether `user` currently holds an unrevoked certificate.
    pub fn is_active(&self, user: &str) -> bool {
        self.state.read().ledger.is_active(user)
    }

    /// A snapshot of the derived ledger state.
    pub fn ledger(&self) -> LedgerState {
        self.state.read().ledger.clone()
    }

    /// Register an application-state processor.
    pub fn add_observer(&self, observer: Arc<dyn TransactionObserver>) {
        self.observers.write().push(observer);
    }

    /// Take the exchange lock, blocking until it is free.
    pub fn begin_exchange(&self) -> ExchangeGuard {
        self.exchange.acquire()
    }

    pub fn try_begin_exchange(&self) -> Option<ExchangeGuard> {
        self.exchange.try_acquire()
    }

    /// Release the exchange lock.
    pub fn end_exchange(&self, guard: ExchangeGuard) {
        drop(guard);
    }

    pub fn is_exchange_in_progress(&self) -> bool {
        self.exchange.is_held()
    }

    /// Append a block signed by an actively certified user on top of the root.
    pub fn add_user_block(
        &self,
        transactions: Vec<Transaction>,
        signer: &SigningIdentity,
    ) -> Result<SignedBlock> {
        let _guard = self.begin_exchange();
        self.issue(transactions, signer, true)
    }

    /// Append a block signed by the admin. The admin is trust-rooted, so no
    /// certificate check applies beyond matching the trust anchor.
    pub fn add_admin_block(
        &self,
        transactions: Vec<Transaction>,
        admin: &SigningIdentity,
    ) -> Result<SignedBlock> {
        if admin.user_id() != self.credentials.admin_id()
            || admin.public_key() != self.credentials.admin_public_key()
        {
            return Err(ChainError::PermissionDenied(format!(
                "{} is not the certificate authority",
                admin.user_id()
            )));
        }
        let _guard = self.begin_exchange();
        self.issue(transactions, admin, false)
    }

    fn issue(
        &self,
        transactions: Vec<Transaction>,
        signer: &SigningIdentity,
        require_certificate: bool,
    ) -> Result<SignedBlock> {
        let mut state = self.state.write();
        let root = state.root.ok_or(ChainError::NotBootstrapped)?;
        if require_certificate && state.ledger.active_key(signer.user_id()) != Some(signer.public_key()) {
            return Err(ChainError::PermissionDenied(format!(
                "{} does not hold an active certificate",
                signer.user_id()
            )));
        }
        let block = signer.issue([root], transactions, chrono::Utc::now().timestamp_millis());
        let added = self.commit(&mut state, vec![block.clone()], block.hash())?;
        drop(state);
        debug!(hash = %block.hash().short(), author = signer.user_id(), "issued block");
        self.notify(&added);
        Ok(block)
    }

    /// Check a candidate batch (keyed by hash) against the local history.
    pub fn verify_blocks(&self, candidate: &HashMap<Hash, SignedBlock>) -> Result<()> {
        let state = self.state.read();
        let ctx = VerificationContext {
            admin_id: self.credentials.admin_id(),
            admin_key: self.credentials.admin_public_key(),
            ledger: &state.ledger,
            stored: &state.blocks,
        };
        verify_batch(candidate, &ctx)
    }

    /// Boolean form of [`Repository::verify_blocks`].
    pub fn verify_blocks_ok(&self, candidate: &HashMap<Hash, SignedBlock>) -> bool {
        self.verify_blocks(candidate).is_ok()
    }

    /// Store a verified batch and move the root to `new_root`.
    /// Blocks already present are skipped. Returns how many were new.
    pub fn update_chain(
        &self,
        blocks: impl IntoIterator<Item = SignedBlock>,
        new_root: Hash,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let added = self.commit(&mut state, blocks.into_iter().collect(), new_root)?;
        drop(state);
        info!(root = %new_root.short(), added = added.len(), "chain updated");
        self.notify(&added);
        Ok(added.len())
    }

    // Persists blocks before the root pointer so a crash never leaves the
    // root naming an unstored block.
    fn commit(
        &self,
        state: &mut ChainState,
        blocks: Vec<SignedBlock>,
        new_root: Hash,
    ) -> Result<Vec<SignedBlock>> {
        let mut fresh: HashMap<Hash, SignedBlock> = HashMap::new();
        for block in blocks {
            if !state.blocks.contains_key(&block.hash()) {
                fresh.insert(block.hash(), block);
            }
        }
        if !state.blocks.contains_key(&new_root) && !fresh.contains_key(&new_root) {
            return Err(ChainError::NotFound(new_root));
        }

        for (hash, block) in &fresh {
            self.store.put(&hash.to_hex(), &postcard::to_allocvec(block)?)?;
        }
        self.store.put(ROOT_KEY, new_root.to_hex().as_bytes())?;

        let delta = LedgerState::from_blocks(fresh.values());
        state.ledger.join_assign(&delta);
        let added: Vec<SignedBlock> = fresh.into_values().collect();
        for block in &added {
            state.blocks.insert(block.hash(), block.clone());
        }
        state.root = Some(new_root);
        Ok(added)
    }

    fn notify(&self, blocks: &[SignedBlock]) {
        let observers = self.observers.read();
        for block in blocks {
            for observer in observers.iter() {
                observer.observe(block);
            }
        }
    }

    /// Every block reachable from `hash` through parent links, excluding `hash`.
    pub fn ancestors(&self, hash: &Hash) -> Result<HashSet<Hash>> {
        let state = self.state.read();
        ancestors_in(&state.blocks, hash)
    }

    /// Users who authored a proof-of-witness block descending from `hash`.
    pub fn witnesses_of(&self, hash: &Hash) -> Result<BTreeSet<String>> {
        let state = self.state.read();
        if !state.blocks.contains_key(hash) {
            return Err(ChainError::NotFound(*hash));
        }
        let mut witnesses = BTreeSet::new();
        for witness in state.ledger.witness_blocks() {
            let Some(block) = state.blocks.get(witness) else {
                continue;
            };
            if witness != hash && ancestors_in(&state.blocks, witness)?.contains(hash) {
                witnesses.insert(block.author_id().to_string());
            }
        }
        Ok(witnesses)
    }
}

fn ancestors_in(blocks: &HashMap<Hash, SignedBlock>, hash: &Hash) -> Result<HashSet<Hash>> {
    let start = blocks.get(hash).ok_or(ChainError::NotFound(*hash))?;
    let mut result = HashSet::new();
    let mut queue: VecDeque<Hash> = start.parent_hashes().iter().copied().collect();

    while let Some(current) = queue.pop_front() {
        if !result.insert(current) {
            continue;
        }
        if let Some(block) = blocks.get(&current) {
            queue.extend(block.parent_hashes().iter().copied());
        }
    }
    Ok(result)
}

fn load_state(store: &dyn BlobStore) -> Result<ChainState> {
    let mut state = ChainState::default();
    let Some(raw) = store.get(ROOT_KEY)? else {
        return Ok(state);
    };
    let root = std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| Hash::from_hex(s.trim()))
        .ok_or_else(|| ChainError::Storage("root pointer is not a hash".into()))?;

    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        if state.blocks.contains_key(&hash) {
            continue;
        }
        let bytes = store
            .get(&hash.to_hex())?
            .ok_or_else(|| ChainError::Storage(format!("dangling reference to {}", hash.short())))?;
        let block: SignedBlock = postcard::from_bytes(&bytes)?;
        if block.hash() != hash {
            return Err(ChainError::Storage(format!(
                "blob {} holds block {}",
                hash.short(),
                block.hash().short()
            )));
        }
        stack.extend(block.parent_hashes().iter().copied());
        state.ledger.absorb(&block);
        state.blocks.insert(hash, block);
    }
    state.root = Some(root);
    info!(root = %root.short(), blocks = state.blocks.len(), "loaded repository");
    Ok(state)
}
