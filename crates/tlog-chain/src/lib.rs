//! # tlog-chain
//!
//! The signed block DAG behind Tamperlog.
//!
//! This crate provides:
//! - Content-addressed, signed blocks with a canonical byte encoding
//! - The credential store interface and password-sealed identities
//! - Derived certificate lineage and witness index ([`LedgerState`])
//! - The [`Repository`]: storage, root pointer, batch verification and
//!   atomic chain updates
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ed25519_dalek::SigningKey;
//! use tlog_chain::{MemoryCredentialStore, Repository, SigningIdentity, Transaction};
//!
//! let admin = SigningIdentity::new("ca", "Origin", SigningKey::from_bytes(&[1; 32]));
//! let alice = SigningIdentity::new("alice", "ward-3", SigningKey::from_bytes(&[2; 32]));
//! let credentials = MemoryCredentialStore::new("ca", admin.public_key())
//!     .with_user(alice.clone(), "secret");
//!
//! let repo = Repository::in_memory(Arc::new(credentials));
//! repo.bootstrap(admin.genesis([alice.certificate()])).unwrap();
//!
//! let block = repo
//!     .add_user_block(vec![Transaction::record_request("chart-7", "audit")], &alice)
//!     .unwrap();
//! assert_eq!(repo.root_hash(), Some(block.hash()));
//! ```

mod block;
mod credentials;
mod error;
mod hash;
mod ledger;
mod lock;
mod repository;
mod store;
mod transaction;
mod verify;

pub use block::{
    compute_hash, sign, verify, BlockBuilder, BlockSignature, RawSignedBlock, SignedBlock,
    UnsignedBlock, GENESIS_LOCATION,
};
pub use credentials::{
    password_digest, public_key_from_hex, public_key_hex, signing_key_from_hex, CredentialStore,
    MemoryCredentialStore, SigningIdentity,
};
pub use error::{ChainError, CredentialError, Result};
pub use hash::{decode_hex, encode_hex, Hash, Hasher};
pub use ledger::{LedgerState, TransactionObserver};
pub use lock::ExchangeGuard;
pub use repository::Repository;
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore, ROOT_KEY};
pub use transaction::{Transaction, TransactionKind};
