//! Unsigned and signed blocks, canonical encoding, signing and hashing.
//!
//! A block's identity is `SHA256(canonical_bytes(unsigned) || signature)`.
//! Canonical bytes sort parent hashes and transactions so that two blocks
//! built from the same content in a different order hash identically.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::{encode_hex, Hash, Hasher};
use crate::transaction::{put_field, Transaction, TransactionKind};

/// Location recorded on genesis blocks.
pub const GENESIS_LOCATION: &str = "Origin";

const DOMAIN_TAG: &[u8] = b"tlog-block-v1";

/// Block content before signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedBlock {
    author_id: String,
    timestamp: i64,
    location: String,
    parent_hashes: Vec<Hash>,
    transactions: Vec<Transaction>,
}

impl UnsignedBlock {
    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Milliseconds since the Unix epoch, as recorded by the author.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn parent_hashes(&self) -> &[Hash] {
        &self.parent_hashes
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty()
    }

    /// The exact bytes that are signed and hashed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + 32 * self.parent_hashes.len());
        put_field(&mut out, DOMAIN_TAG);
        put_field(&mut out, self.author_id.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        put_field(&mut out, self.location.as_bytes());

        let mut parents = self.parent_hashes.clone();
        parents.sort();
        out.extend_from_slice(&(parents.len() as u32).to_be_bytes());
        for parent in &parents {
            out.extend_from_slice(parent.as_bytes());
        }

        let mut transactions: Vec<Vec<u8>> =
            self.transactions.iter().map(Transaction::canonical_bytes).collect();
        transactions.sort();
        out.extend_from_slice(&(transactions.len() as u32).to_be_bytes());
        for tx in &transactions {
            put_field(&mut out, tx);
        }
        out
    }

    /// Sign with the author's key.
    pub fn sign(self, key: &SigningKey) -> SignedBlock {
        let signature = sign(&self, key);
        SignedBlock::new(self, signature)
    }
}

/// Raw signature bytes over a block's canonical encoding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockSignature(Vec<u8>);

impl BlockSignature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BlockSignature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BlockSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = encode_hex(&self.0);
        write!(f, "BlockSignature({}...)", &hex[..hex.len().min(16)])
    }
}

/// Sign an unsigned block's canonical bytes.
pub fn sign(unsigned: &UnsignedBlock, key: &SigningKey) -> BlockSignature {
    let signature = key.sign(&unsigned.canonical_bytes());
    BlockSignature(signature.to_bytes().to_vec())
}

/// `SHA256(canonical_bytes || signature)`.
pub fn compute_hash(unsigned: &UnsignedBlock, signature: &BlockSignature) -> Hash {
    Hasher::hash_all(&[unsigned.canonical_bytes().as_slice(), signature.as_bytes()])
}

/// Check a block's signature against a public key. Does not look at the hash.
pub fn verify(signed: &SignedBlock, key: &VerifyingKey) -> bool {
    let Ok(signature) = Signature::from_slice(signed.signature.as_bytes()) else {
        return false;
    };
    key.verify(&signed.unsigned.canonical_bytes(), &signature).is_ok()
}

/// A signed, content-addressed block. Immutable; the hash is derived once
/// on construction and is never transmitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSignedBlock", into = "RawSignedBlock")]
pub struct SignedBlock {
    unsigned: UnsignedBlock,
    signature: BlockSignature,
    hash: Hash,
}

/// Serialized form of [`SignedBlock`]: the body and the signature only.
#[doc(hidden)]
#[derive(Serialize, Deserialize)]
pub struct RawSignedBlock {
    unsigned: UnsignedBlock,
    signature: BlockSignature,
}

impl From<RawSignedBlock> for SignedBlock {
    fn from(raw: RawSignedBlock) -> Self {
        SignedBlock::new(raw.unsigned, raw.signature)
    }
}

impl From<SignedBlock> for RawSignedBlock {
    fn from(block: SignedBlock) -> Self {
        RawSignedBlock {
            unsigned: block.unsigned,
            signature: block.signature,
        }
    }
}

impl SignedBlock {
    pub fn new(unsigned: UnsignedBlock, signature: BlockSignature) -> Self {
        let hash = compute_hash(&unsigned, &signature);
        Self {
            unsigned,
            signature,
            hash,
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn unsigned(&self) -> &UnsignedBlock {
        &self.unsigned
    }

    pub fn signature(&self) -> &BlockSignature {
        &self.signature
    }

    pub fn author_id(&self) -> &str {
        &self.unsigned.author_id
    }

    pub fn timestamp(&self) -> i64 {
        self.unsigned.timestamp
    }

    pub fn location(&self) -> &str {
        &self.unsigned.location
    }

    pub fn parent_hashes(&self) -> &[Hash] {
        &self.unsigned.parent_hashes
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.unsigned.transactions
    }

    pub fn is_genesis(&self) -> bool {
        self.unsigned.is_genesis()
    }

    /// Whether any transaction in this block has the given kind.
    pub fn carries(&self, kind: TransactionKind) -> bool {
        self.transactions().iter().any(|tx| tx.kind() == kind)
    }

    pub fn verify(&self, key: &VerifyingKey) -> bool {
        verify(self, key)
    }

    /// Re-derive the hash from the block's fields.
    pub fn recompute_hash(&self) -> Hash {
        compute_hash(&self.unsigned, &self.signature)
    }

    /// Whether both the memoized and the re-derived hash equal `expected`.
    pub fn verify_hash(&self, expected: &Hash) -> bool {
        self.hash == *expected && self.recompute_hash() == *expected
    }
}

/// Builder for unsigned blocks.
#[derive(Clone, Debug)]
pub struct BlockBuilder {
    author_id: String,
    timestamp: i64,
    location: String,
    parent_hashes: Vec<Hash>,
    transactions: Vec<Transaction>,
}

impl BlockBuilder {
    /// Start a block authored by `author_id`, stamped with the current time.
    pub fn new(author_id: impl Into<String>) -> Self {
        BlockBuilder {
            author_id: author_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            location: String::new(),
            parent_hashes: Vec::new(),
            transactions: Vec::new(),
        }
    }

    /// Start a genesis block. Genesis blocks have a fixed timestamp and
    /// location so that independently built copies hash identically.
    pub fn genesis(admin_id: impl Into<String>) -> Self {
        Self::new(admin_id)
            .with_timestamp(0)
            .with_location(GENESIS_LOCATION)
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_parent(mut self, parent: Hash) -> Self {
        if !self.parent_hashes.contains(&parent) {
            self.parent_hashes.push(parent);
        }
        self
    }

    pub fn with_parents(self, parents: impl IntoIterator<Item = Hash>) -> Self {
        parents.into_iter().fold(self, BlockBuilder::with_parent)
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    pub fn with_transactions(mut self, transactions: impl IntoIterator<Item = Transaction>) -> Self {
        self.transactions.extend(transactions);
        self
    }

    pub fn build(self) -> UnsignedBlock {
        UnsignedBlock {
            author_id: self.author_id,
            timestamp: self.timestamp,
            location: self.location,
            parent_hashes: self.parent_hashes,
            transactions: self.transactions,
        }
    }
}
