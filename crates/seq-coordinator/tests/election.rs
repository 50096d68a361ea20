use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use rollup_db_sled::SledDb;
use rollup_primitives::l1::{L1IncomingMessageHeader, L1_MESSAGE_TYPE_L2_MESSAGE};
use rollup_seq_coordinator::keys::{liveliness_key_for, encode_msg_count, CHOSEN_KEY, MSG_COUNT_KEY, PRIORITIES_KEY};
use rollup_seq_coordinator::{CoordinationStore, CoordinatorError, MemoryStore, SeqCoordinator, SeqCoordinatorConfig};
use rollup_streamer::engine::HashChainEngine;
use rollup_streamer::hooks::NoopHooks;
use rollup_streamer::{StreamerConfig, TransactionStreamer};

struct Node {
    _dir: tempfile::TempDir,
    streamer: Arc<TransactionStreamer>,
    coord: Arc<SeqCoordinator>,
}

fn node(store: &Arc<MemoryStore>, url: &str, lockout: Duration) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let streamer = Arc::new(TransactionStreamer::new(
        Arc::new(SledDb::open(dir.path()).unwrap()),
        Arc::new(HashChainEngine::new(30_000_000)),
        StreamerConfig::default(),
    ));
    let config = SeqCoordinatorConfig {
        my_url: url.to_string(),
        lockout_duration: lockout,
        lockout_spare: lockout / 4,
        update_interval: Duration::from_millis(10),
        retry_interval: Duration::from_millis(5),
        max_lag: 5,
        ..Default::default()
    };
    let coord = Arc::new(SeqCoordinator::new(store.clone(), streamer.clone(), config).unwrap());
    streamer.set_coordinator(coord.clone());
    Node { _dir: dir, streamer, coord }
}

async fn fleet(lockout: Duration) -> (Arc<MemoryStore>, Node, Node) {
    let store = Arc::new(MemoryStore::new());
    store.set(PRIORITIES_KEY, b"a,b", Duration::from_secs(3600)).await.unwrap();
    let a = node(&store, "a", lockout);
    let b = node(&store, "b", lockout);
    (store, a, b)
}

async fn elect(n: &Node) {
    for _ in 0..3 {
        n.coord.update().await;
        if n.coord.currently_chosen() {
            return;
        }
    }
    panic!("{} was not elected", n.coord.url());
}

fn header(ts: u64) -> L1IncomingMessageHeader {
    L1IncomingMessageHeader {
        kind: L1_MESSAGE_TYPE_L2_MESSAGE,
        poster: Address::ZERO,
        block_number: 1,
        timestamp: ts,
        request_id: None,
        l1_base_fee: U256::ZERO,
    }
}

fn coordinator_err(err: &anyhow::Error) -> &CoordinatorError {
    err.downcast_ref::<CoordinatorError>().expect("coordinator error")
}

#[tokio::test]
async fn highest_priority_live_node_is_chosen() {
    let (store, a, b) = fleet(Duration::from_secs(5)).await;
    b.coord.update().await;
    elect(&a).await;
    b.coord.update().await;

    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), Some(b"a".to_vec()));
    assert!(!b.coord.currently_chosen());
    assert!(store.exists(&liveliness_key_for("b")).await.unwrap());

    let outcomes = b.streamer.sequence_transactions(&header(1), &[vec![1, 2, 3]], &NoopHooks).await;
    let err = outcomes.unwrap_err();
    assert!(matches!(coordinator_err(&err), CoordinatorError::LockoutExpired));
    assert_eq!(b.streamer.get_message_count().unwrap(), 0);
}

#[tokio::test]
async fn standby_replays_what_the_chosen_node_sequenced() {
    let (store, a, b) = fleet(Duration::from_secs(5)).await;
    elect(&a).await;

    for ts in [10, 11] {
        let outcomes = a.streamer.sequence_transactions(&header(ts), &[vec![ts as u8, 1]], &NoopHooks).await.unwrap();
        assert!(outcomes.iter().all(Result::is_ok));
    }
    assert_eq!(store.get(MSG_COUNT_KEY).await.unwrap(), Some(encode_msg_count(2)));

    b.coord.update().await;
    assert_eq!(b.streamer.get_message_count().unwrap(), 2);
    for pos in 0..2 {
        assert_eq!(b.streamer.get_message(pos).unwrap(), a.streamer.get_message(pos).unwrap());
    }
}

#[tokio::test]
async fn node_behind_cannot_seize_and_release_hands_over() {
    let (store, a, b) = fleet(Duration::from_secs(5)).await;
    b.coord.update().await;
    elect(&a).await;
    for ts in [10, 11, 12] {
        a.streamer.sequence_transactions(&header(ts), &[vec![7, ts as u8]], &NoopHooks).await.unwrap();
    }
    a.coord.release().await.unwrap();
    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), None);
    assert!(!store.exists(&liveliness_key_for("a")).await.unwrap());

    let err = b.coord.acquire_lockout_and_write_message(0, 0, None).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Behind { expected: 0, remote: 3 }));
    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), None);

    // The next round catches up from the store first, then claims.
    b.coord.update().await;
    assert_eq!(b.streamer.get_message_count().unwrap(), 3);
    assert!(b.coord.currently_chosen());
    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), Some(b"b".to_vec()));

    // A released node stays out of the running until it seeks the lockout again.
    a.coord.update().await;
    assert!(!store.exists(&liveliness_key_for("a")).await.unwrap());
    a.coord.seek_lockout();
    a.coord.update().await;
    assert!(store.exists(&liveliness_key_for("a")).await.unwrap());
}

#[tokio::test]
async fn lagging_standby_withdraws_liveliness() {
    let (store, _a, b) = fleet(Duration::from_secs(5)).await;
    store.set(MSG_COUNT_KEY, &encode_msg_count(100), Duration::from_secs(60)).await.unwrap();
    b.coord.update().await;
    assert!(!store.exists(&liveliness_key_for("b")).await.unwrap());

    store.set(MSG_COUNT_KEY, &encode_msg_count(3), Duration::from_secs(60)).await.unwrap();
    b.coord.update().await;
    assert!(store.exists(&liveliness_key_for("b")).await.unwrap());
    assert!(!b.coord.currently_chosen());
}

#[tokio::test]
async fn expired_lockout_stops_sequencing_and_frees_the_key() {
    let (store, a, b) = fleet(Duration::from_millis(200)).await;
    elect(&a).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!a.coord.currently_chosen());
    let err = a.streamer.sequence_transactions(&header(5), &[vec![1]], &NoopHooks).await.unwrap_err();
    assert!(matches!(coordinator_err(&err), CoordinatorError::LockoutExpired));
    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), None);

    elect(&b).await;
    assert_eq!(store.get(CHOSEN_KEY).await.unwrap(), Some(b"b".to_vec()));
}
