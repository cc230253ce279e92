#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use std::collections::HashMap;
use std::sync::Arc;
use tlog_chain::{Hash, MemoryCredentialStore, Repository, SignedBlock, SigningIdentity};

pub const PASSWORD: &str = "correct horse";

pub fn identity(name: &str, seed: u8) -> SigningIdentity {
    SigningIdentity::new(name, format!("{}-device", name), SigningKey::from_bytes(&[seed; 32]))
}

pub fn admin() -> SigningIdentity {
    identity("ca", 1)
}

pub fn alice() -> SigningIdentity {
    identity("alice", 2)
}

pub fn bob() -> SigningIdentity {
    identity("bob", 3)
}

/// Genesis shared by every test device: the admin plus alice and bob.
pub fn genesis() -> SignedBlock {
    admin().genesis([alice().certificate(), bob().certificate()])
}

pub fn credentials_for(user: &SigningIdentity) -> Arc<MemoryCredentialStore> {
    Arc::new(
        MemoryCredentialStore::new("ca", admin().public_key())
            .with_admin(admin(), PASSWORD)
            .with_user(user.clone(), PASSWORD),
    )
}

/// A bootstrapped in-memory repository owned by `user`.
pub fn device(user: &SigningIdentity) -> Repository {
    let repo = Repository::in_memory(credentials_for(user));
    repo.bootstrap(genesis()).unwrap();
    repo
}

pub fn batch(blocks: impl IntoIterator<Item = SignedBlock>) -> HashMap<Hash, SignedBlock> {
    blocks.into_iter().map(|b| (b.hash(), b)).collect()
}
