#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::Duration;
use tlog_chain::{MemoryCredentialStore, Repository, SignedBlock, SigningIdentity, Transaction};
use tlog_exchange::{run_exchange_at, ExchangeConfig, ExchangeReport, FrameChannel, MemoryChannel, Result};

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

pub fn carol() -> SigningIdentity {
    identity("carol", 4)
}

pub fn genesis() -> SignedBlock {
    admin().genesis([alice().certificate(), bob().certificate(), carol().certificate()])
}

/// A bootstrapped in-memory repository on `user`'s device.
pub fn device(user: &SigningIdentity) -> Arc<Repository> {
    let credentials = MemoryCredentialStore::new("ca", admin().public_key())
        .with_admin(admin(), "pw")
        .with_user(user.clone(), "pw");
    let repo = Repository::in_memory(Arc::new(credentials));
    repo.bootstrap(genesis()).unwrap();
    Arc::new(repo)
}

pub fn append(repo: &Repository, user: &SigningIdentity, record: &str) -> SignedBlock {
    repo.add_user_block(vec![Transaction::record_request(record, "test")], user)
        .unwrap()
}

pub fn config() -> ExchangeConfig {
    ExchangeConfig::builder()
        .round_trip_timeout(Duration::from_secs(5))
        .teardown_grace(Duration::from_millis(500))
        .cooldown(Duration::ZERO)
        .build()
}

/// Run both halves of an exchange over an in-process channel.
pub async fn exchange(
    a: &Arc<Repository>,
    a_id: &SigningIdentity,
    a_ts: i64,
    b: &Arc<Repository>,
    b_id: &SigningIdentity,
    b_ts: i64,
) -> (Result<ExchangeReport>, Result<ExchangeReport>) {
    let (left, right) = MemoryChannel::pair();
    exchange_over(Arc::new(left), a, a_id, a_ts, Arc::new(right), b, b_id, b_ts).await
}

#[allow(clippy::too_many_arguments)]
pub async fn exchange_over(
    left: Arc<dyn FrameChannel>,
    a: &Arc<Repository>,
    a_id: &SigningIdentity,
    a_ts: i64,
    right: Arc<dyn FrameChannel>,
    b: &Arc<Repository>,
    b_id: &SigningIdentity,
    b_ts: i64,
) -> (Result<ExchangeReport>, Result<ExchangeReport>) {
    let config = config();
    tokio::join!(
        run_exchange_at(left, a.clone(), a_id.clone(), &config, a_ts),
        run_exchange_at(right, b.clone(), b_id.clone(), &config, b_ts),
    )
}

/// Every block reachable from the root is stored.
pub fn assert_closed(repo: &Repository) {
    let root = repo.root_hash().unwrap();
    for hash in repo.ancestors(&root).unwrap() {
        assert!(repo.contains(&hash), "missing ancestor {}", hash);
    }
}
