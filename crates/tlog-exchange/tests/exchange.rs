mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tlog_chain::{Transaction, TransactionKind};
use tlog_exchange::{
    run_exchange_at, Connector, ExchangeError, ExchangeMessage, ExchangeState, Exchanger,
    FrameChannel, MemoryChannel, MergeOutcome, Result, Retrieval, StreamChannel,
};

#[tokio::test]
async fn identical_histories_are_left_alone() {
    let a = device(&alice());
    let b = device(&bob());
    let before = a.root_hash().unwrap();

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(rb.outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(ra.blocks_added, 0);
    assert_eq!(a.root_hash(), Some(before));
    assert_eq!(b.root_hash(), Some(before));
    assert_eq!(a.len(), 1);
}

#[tokio::test]
async fn concurrent_branches_converge_on_two_witnesses() {
    let a = device(&alice());
    let b = device(&bob());
    let a1 = append(&a, &alice(), "chart-1");
    let b1 = append(&b, &bob(), "chart-2");

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.outcome, MergeOutcome::Reconciled);
    assert_eq!(rb.outcome, MergeOutcome::Reconciled);
    assert_eq!(ra.new_root, rb.new_root);
    assert_eq!(a.root_hash(), b.root_hash());

    // The earlier side witnesses both branches, the later side seals it.
    let root = a.get_root().unwrap();
    assert_eq!(root.author_id(), "bob");
    assert_eq!(root.timestamp(), 200);
    assert!(root.carries(TransactionKind::ProofOfWitness));
    let first = a.get_block(&root.parent_hashes()[0]).unwrap();
    assert_eq!(root.parent_hashes().len(), 1);
    assert_eq!(first.author_id(), "alice");
    let mut parents = first.parent_hashes().to_vec();
    parents.sort();
    let mut expected = vec![a1.hash(), b1.hash()];
    expected.sort();
    assert_eq!(parents, expected);

    for repo in [&a, &b] {
        assert!(repo.contains(&a1.hash()));
        assert!(repo.contains(&b1.hash()));
        assert_eq!(repo.len(), 5);
        assert_closed(repo);
    }
    assert_eq!(
        a.witnesses_of(&a1.hash()).unwrap().into_iter().collect::<Vec<_>>(),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn one_user_on_two_devices_gets_a_single_ordering_witness() {
    // Both devices belong to alice and share the same genesis bytes.
    let a = device(&alice());
    let b = device(&alice());
    assert_eq!(a.root_hash(), b.root_hash());
    let a1 = append(&a, &alice(), "chart-1");
    let b1 = append(&b, &alice(), "chart-2");

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &alice(), 200).await;
    let root = ra.unwrap().new_root;
    assert_eq!(rb.unwrap().new_root, root);

    let ancestors = a.ancestors(&root).unwrap();
    assert!(ancestors.contains(&genesis().hash()));
    assert!(ancestors.contains(&a1.hash()));
    assert!(ancestors.contains(&b1.hash()));
    let ledger = a.ledger();
    assert_eq!(ancestors.iter().filter(|h| ledger.is_witness(h)).count(), 1);

    let (ra, rb) = exchange(&a, &alice(), 300, &b, &alice(), 400).await;
    assert_eq!(ra.unwrap().outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(rb.unwrap().outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(a.root_hash(), Some(root));
}

#[tokio::test]
async fn later_timestamp_on_the_other_side_flips_the_witness_order() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-1");
    append(&b, &bob(), "chart-2");

    let (ra, rb) = exchange(&a, &alice(), 900, &b, &bob(), 300).await;
    assert_eq!(ra.unwrap().new_root, rb.unwrap().new_root);

    let root = b.get_root().unwrap();
    assert_eq!(root.author_id(), "alice");
    let first = b.get_block(&root.parent_hashes()[0]).unwrap();
    assert_eq!(first.author_id(), "bob");
    assert_eq!(first.timestamp(), 300);
}

#[tokio::test]
async fn equal_timestamps_still_converge() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-1");
    append(&b, &bob(), "chart-2");

    let (ra, rb) = exchange(&a, &alice(), 500, &b, &bob(), 500).await;
    assert_eq!(ra.unwrap().new_root, rb.unwrap().new_root);
    assert_eq!(a.root_hash(), b.root_hash());
}

#[tokio::test]
async fn second_exchange_after_convergence_is_a_no_op() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-1");
    append(&b, &bob(), "chart-2");

    let (ra, _) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;
    let merged = ra.unwrap().new_root;
    let len = a.len();

    let (ra, rb) = exchange(&a, &alice(), 300, &b, &bob(), 400).await;
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(rb.outcome, MergeOutcome::AlreadyMerged);
    assert_eq!(a.root_hash(), Some(merged));
    assert_eq!(a.len(), len);
}

#[tokio::test]
async fn behind_side_fast_forwards_and_ahead_side_absorbs() {
    let a = device(&alice());
    let b = device(&bob());
    let b1 = append(&b, &bob(), "chart-2");
    let b2 = append(&b, &bob(), "chart-3");

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.outcome, MergeOutcome::FastForward);
    assert_eq!(rb.outcome, MergeOutcome::Absorbed);
    assert_eq!(ra.new_root, rb.new_root);
    assert_eq!(ra.blocks_added, 3);
    assert_eq!(rb.blocks_added, 1);

    let root = a.get_root().unwrap();
    assert_eq!(root.author_id(), "bob");
    assert_eq!(root.parent_hashes(), &[b2.hash()]);
    assert!(a.contains(&b1.hash()));
    assert_closed(&a);
}

#[tokio::test]
async fn deep_history_is_fetched_completely() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-0");
    let mut bob_blocks = Vec::new();
    for i in 0..12 {
        bob_blocks.push(append(&b, &bob(), &format!("chart-{}", i)));
    }

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;
    ra.unwrap();
    rb.unwrap();

    for block in &bob_blocks {
        assert!(a.contains(&block.hash()));
    }
    assert_closed(&a);
    assert_closed(&b);
    assert_eq!(a.len(), b.len());
}

#[tokio::test]
async fn three_devices_converge_pairwise() {
    let a = device(&alice());
    let b = device(&bob());
    let c = device(&carol());
    append(&a, &alice(), "a");
    append(&b, &bob(), "b");
    append(&c, &carol(), "c");

    let (x, y) = exchange(&a, &alice(), 10, &b, &bob(), 20).await;
    x.unwrap();
    y.unwrap();
    let (x, y) = exchange(&b, &bob(), 30, &c, &carol(), 40).await;
    x.unwrap();
    y.unwrap();
    let (x, y) = exchange(&a, &alice(), 50, &c, &carol(), 60).await;
    x.unwrap();
    y.unwrap();
    let (x, y) = exchange(&a, &alice(), 70, &b, &bob(), 80).await;
    x.unwrap();
    y.unwrap();

    assert_eq!(a.root_hash(), b.root_hash());
    assert_eq!(a.root_hash(), c.root_hash());
    for repo in [&a, &b, &c] {
        assert_closed(repo);
    }
}

#[tokio::test]
async fn revoked_author_is_refused_and_roots_stay_put() {
    let a = device(&alice());
    let b = device(&bob());
    a.add_admin_block(vec![Transaction::revoke_certificate("bob")], &admin())
        .unwrap();
    append(&b, &bob(), "chart-9");
    let a_root = a.root_hash();
    let b_root = b.root_hash();

    let (ra, rb) = exchange(&a, &alice(), 100, &b, &bob(), 200).await;

    assert!(ra.is_err());
    assert!(rb.is_err());
    assert_eq!(a.root_hash(), a_root);
    assert_eq!(b.root_hash(), b_root);
    assert!(!a.is_exchange_in_progress());
    assert!(!b.is_exchange_in_progress());
    assert!(!a.ledger().is_active("bob"));
    assert!(b.ledger().is_active("bob"));
}

#[tokio::test]
async fn vanished_peer_ends_exchange_without_changes() {
    let a = device(&alice());
    let root = a.root_hash();
    let (left, right) = MemoryChannel::pair();

    let peer = tokio::spawn(async move {
        // Read the first request, then hang up.
        let first = right.recv().await.unwrap();
        assert_eq!(
            ExchangeMessage::decode(&first).unwrap(),
            ExchangeMessage::GetRootBlockRequest
        );
        drop(right);
    });

    let result = run_exchange_at(Arc::new(left), a.clone(), alice(), &config(), 100).await;
    peer.await.unwrap();

    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert_eq!(a.root_hash(), root);
    assert!(!a.is_exchange_in_progress());
}

#[tokio::test]
async fn interrupt_from_peer_aborts() {
    let a = device(&alice());
    let (left, right) = MemoryChannel::pair();
    right
        .send(ExchangeMessage::MergeInterrupted.encode().unwrap())
        .await
        .unwrap();

    let result = run_exchange_at(Arc::new(left), a.clone(), alice(), &config(), 100).await;
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert!(!a.is_exchange_in_progress());

    // The aborting side tells the peer why it stopped.
    let mut saw_interrupt = false;
    while let Some(frame) = right.recv().await {
        if ExchangeMessage::decode(&frame).unwrap() == ExchangeMessage::MergeInterrupted {
            saw_interrupt = true;
            break;
        }
    }
    assert!(saw_interrupt);
}

#[tokio::test]
async fn unsolicited_ack_is_a_protocol_violation() {
    let a = device(&alice());
    let (left, right) = MemoryChannel::pair();
    right
        .send(ExchangeMessage::MergeCompleteAck.encode().unwrap())
        .await
        .unwrap();

    let result = run_exchange_at(Arc::new(left), a.clone(), alice(), &config(), 100).await;
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert!(!a.is_exchange_in_progress());
}

#[tokio::test]
async fn garbage_frame_terminates() {
    let a = device(&alice());
    let (left, right) = MemoryChannel::pair();
    right.send(vec![99, 1, 2, 3]).await.unwrap();

    let result = run_exchange_at(Arc::new(left), a.clone(), alice(), &config(), 100).await;
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let a = device(&alice());
    let (left, _right) = MemoryChannel::pair();
    let config = tlog_exchange::ExchangeConfig::builder()
        .round_trip_timeout(Duration::from_millis(50))
        .teardown_grace(Duration::from_millis(50))
        .build();

    let result = run_exchange_at(Arc::new(left), a.clone(), alice(), &config, 100).await;
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert!(!a.is_exchange_in_progress());
}

fn tight_config() -> tlog_exchange::ExchangeConfig {
    tlog_exchange::ExchangeConfig::builder()
        .round_trip_timeout(Duration::from_millis(200))
        .teardown_grace(Duration::from_millis(100))
        .build()
}

#[tokio::test]
async fn peer_flooding_requests_without_reading_is_cut_off() {
    let a = device(&alice());
    let (left, right) = MemoryChannel::pair_with_capacity(4);
    let flood = ExchangeMessage::GetTimestampRequest.encode().unwrap();
    tokio::spawn(async move {
        for _ in 0..500 {
            if right.send(flood.clone()).await.is_err() {
                break;
            }
        }
        std::future::pending::<()>().await;
    });

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        run_exchange_at(Arc::new(left), a.clone(), alice(), &tight_config(), 100),
    )
    .await
    .expect("exchange must end on its own");
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert!(!a.is_exchange_in_progress());
    append(&a, &alice(), "after-flood");
}

#[tokio::test]
async fn peer_silent_after_our_merge_releases_lock() {
    let a = device(&alice());
    let root = a.get_root().unwrap();
    let (left, right) = MemoryChannel::pair();
    let peer = tokio::spawn(async move {
        let frame = right.recv().await.unwrap();
        assert_eq!(ExchangeMessage::decode(&frame).unwrap(), ExchangeMessage::GetRootBlockRequest);
        let answer = ExchangeMessage::GetRootBlockResponse(Retrieval::Found(root));
        right.send(answer.encode().unwrap()).await.unwrap();

        let frame = right.recv().await.unwrap();
        assert_eq!(ExchangeMessage::decode(&frame).unwrap(), ExchangeMessage::MergeComplete);
        // Stay connected and never acknowledge.
        std::future::pending::<()>().await;
    });

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        run_exchange_at(Arc::new(left), a.clone(), alice(), &tight_config(), 100),
    )
    .await
    .expect("exchange must end on its own");
    assert!(matches!(result, Err(ExchangeError::UnexpectedTermination(_))));
    assert!(!a.is_exchange_in_progress());
    assert!(!peer.is_finished());
    peer.abort();
}

#[tokio::test]
async fn unbootstrapped_side_tells_peer_it_is_stopping() {
    let credentials = tlog_chain::MemoryCredentialStore::new("ca", admin().public_key())
        .with_user(alice(), "pw");
    let empty = Arc::new(tlog_chain::Repository::in_memory(Arc::new(credentials)));
    let (left, right) = MemoryChannel::pair();

    let result = run_exchange_at(Arc::new(left), empty.clone(), alice(), &config(), 100).await;
    assert!(result.is_err());
    assert!(!empty.is_exchange_in_progress());

    let frame = right.recv().await.unwrap();
    assert_eq!(ExchangeMessage::decode(&frame).unwrap(), ExchangeMessage::MergeInterrupted);
}

#[tokio::test]
async fn exchange_over_byte_streams() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-1");
    append(&b, &bob(), "chart-2");

    let (left, right) = tokio::io::duplex(64 * 1024);
    let left: Arc<dyn FrameChannel> = Arc::new(StreamChannel::new(left, 1 << 20));
    let right: Arc<dyn FrameChannel> = Arc::new(StreamChannel::new(right, 1 << 20));

    let (ra, rb) = exchange_over(left, &a, &alice(), 100, right, &b, &bob(), 200).await;
    assert_eq!(ra.unwrap().new_root, rb.unwrap().new_root);
    assert_eq!(a.root_hash(), b.root_hash());
}

#[tokio::test]
async fn local_write_waits_for_exchange() {
    let a = device(&alice());
    let guard = a.begin_exchange();

    let writer = {
        let a = a.clone();
        tokio::task::spawn_blocking(move || append(&a, &alice(), "late"))
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished());

    a.end_exchange(guard);
    let block = writer.await.unwrap();
    assert_eq!(a.root_hash(), Some(block.hash()));
}

struct OneShot(Mutex<Option<Arc<dyn FrameChannel>>>);

#[async_trait]
impl Connector for OneShot {
    async fn connect(&self) -> Result<Option<Arc<dyn FrameChannel>>> {
        Ok(self.0.lock().take())
    }
}

#[tokio::test]
async fn exchanger_runs_until_connector_closes() {
    let a = device(&alice());
    let b = device(&bob());
    append(&a, &alice(), "chart-1");
    append(&b, &bob(), "chart-2");

    let (left, right) = MemoryChannel::pair();
    let connector = OneShot(Mutex::new(Some(Arc::new(left))));
    let exchanger = Exchanger::new(a.clone(), alice(), config());
    let mut states = exchanger.subscribe();
    assert_eq!(exchanger.state(), ExchangeState::Idle);

    let peer = {
        let b = b.clone();
        tokio::spawn(async move {
            run_exchange_at(Arc::new(right), b, bob(), &config(), 200).await
        })
    };
    exchanger.run(&connector).await.unwrap();
    peer.await.unwrap().unwrap();

    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ExchangeState::Idle);
    assert_eq!(exchanger.state(), ExchangeState::Idle);
    assert_eq!(a.root_hash(), b.root_hash());
}
