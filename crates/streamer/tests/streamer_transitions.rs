use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use rollup_db_sled::SledDb;
use rollup_inbox::streamer::Streamer;
use rollup_primitives::l1::{L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_L2_MESSAGE};
use rollup_primitives::message::MessageWithMetadata;
use rollup_streamer::engine::{tx_gas, ExecEngine, HashChainEngine};
use rollup_streamer::hooks::{NoopHooks, RevertGasReject};
use rollup_streamer::{SequencingLockout, StreamerConfig, StreamerError, TransactionStreamer, TxError};
use tokio_util::sync::CancellationToken;

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

fn mk_msg(delayed_read: u64, payload: &[u8]) -> MessageWithMetadata {
    MessageWithMetadata {
        message: L1IncomingMessage { header: header(0), l2msg: payload.to_vec(), batch_gas_cost: None },
        delayed_messages_read: delayed_read,
    }
}

fn harness(block_gas_limit: u64) -> (tempfile::TempDir, Arc<TransactionStreamer>, Arc<HashChainEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(SledDb::open(dir.path()).unwrap());
    let engine = Arc::new(HashChainEngine::new(block_gas_limit));
    let config = StreamerConfig { execute_message_loop_delay: Duration::from_millis(5) };
    let streamer = Arc::new(TransactionStreamer::new(db, engine.clone(), config));
    (dir, streamer, engine)
}

fn streamer_err(err: &anyhow::Error) -> &StreamerError {
    err.downcast_ref::<StreamerError>().expect("streamer error")
}

async fn wait_for_blocks(engine: &HashChainEngine, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.head_message_count().await.unwrap() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("block production stalled");
}

#[tokio::test]
async fn replaying_stored_messages_is_a_noop() {
    let (_dir, streamer, _) = harness(1_000_000);
    let msgs = vec![mk_msg(1, b"init"), mk_msg(1, b"a"), mk_msg(2, b"b")];
    streamer.add_messages(0, false, msgs.clone()).await.unwrap();
    streamer.add_messages(0, false, msgs.clone()).await.unwrap();
    streamer.add_messages(1, false, msgs[1..2].to_vec()).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 3);
    assert_eq!(streamer.get_message(2).unwrap(), msgs[2]);
}

#[tokio::test]
async fn divergence_needs_confirmation() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init"), mk_msg(1, b"a"), mk_msg(1, b"b")]).await.unwrap();

    let replacement = vec![mk_msg(1, b"a"), mk_msg(2, b"x")];
    let err = streamer.add_messages(1, false, replacement.clone()).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::ReorgNotAllowed { pos: 2 }));
    assert_eq!(streamer.get_message(2).unwrap().message.l2msg, b"b");

    streamer.add_messages(1, true, replacement).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 3);
    assert_eq!(streamer.get_message(2).unwrap(), mk_msg(2, b"x"));
}

#[tokio::test]
async fn confirmed_shorter_history_truncates_the_tail() {
    let (_dir, streamer, _) = harness(1_000_000);
    let msgs: Vec<_> = (0..5u8).map(|i| mk_msg(1, &[i])).collect();
    streamer.add_messages(0, false, msgs).await.unwrap();
    streamer.add_messages(2, true, vec![mk_msg(1, b"other")]).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 3);
    assert!(streamer.get_message(3).is_err());
}

#[tokio::test]
async fn delayed_read_may_only_step_by_one() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init")]).await.unwrap();

    let err = streamer.add_messages(1, false, vec![mk_msg(3, b"skip")]).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::DelayedMessagesReadJump { pos: 1, from: 1, to: 3 }));

    let err = streamer.add_messages(1, false, vec![mk_msg(0, b"back")]).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::DelayedMessagesReadJump { pos: 1, from: 1, to: 0 }));

    let err = streamer.add_messages(5, false, vec![mk_msg(1, b"gap")]).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::MissingPreviousMessage(4)));
    assert_eq!(streamer.get_message_count().unwrap(), 1);
}

#[tokio::test]
async fn late_batch_gas_cost_is_backfilled() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init"), mk_msg(1, b"a")]).await.unwrap();
    let mut costed = mk_msg(1, b"a");
    costed.message.batch_gas_cost = Some(4_000);
    streamer.add_messages(1, false, vec![costed.clone()]).await.unwrap();
    assert_eq!(streamer.get_message(1).unwrap(), costed);
}

#[tokio::test]
async fn init_message_cannot_be_reorged() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init")]).await.unwrap();
    let err = streamer.reorg_to(0).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::CannotReorgInitMessage));
}

#[tokio::test]
async fn production_follows_the_log_across_reorgs() {
    let (_dir, streamer, engine) = harness(1_000_000);
    let cancel = CancellationToken::new();
    let handle = streamer.clone().start(cancel.clone());

    let msgs: Vec<_> = (0..4u8).map(|i| mk_msg(1, &[i])).collect();
    streamer.add_messages(0, false, msgs.clone()).await.unwrap();
    wait_for_blocks(&engine, 4).await;

    let replay = HashChainEngine::new(1_000_000);
    for (i, msg) in msgs.iter().enumerate() {
        let expected = replay.digest_message(i as u64, msg).await.unwrap();
        assert_eq!(streamer.result_at_message_index(i as u64).unwrap(), Some(expected));
    }

    streamer.reorg_to(2).await.unwrap();
    assert_eq!(engine.head_message_count().await.unwrap(), 2);
    assert_eq!(streamer.result_at_message_index(2).unwrap(), None);

    streamer.add_messages(2, false, vec![mk_msg(2, b"new")]).await.unwrap();
    wait_for_blocks(&engine, 3).await;
    assert!(streamer.result_at_message_index(2).unwrap().is_some());

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn gas_limited_transactions_spill_into_the_next_block() {
    let small = [7u8; 10];
    let (_dir, streamer, engine) = harness(2 * tx_gas(&small) + 100);
    let txes = vec![small.to_vec(), vec![8; 10], vec![9; 10], vec![1; 4000], vec![]];

    let outcomes = streamer.sequence_transactions(&header(5), &txes, &NoopHooks).await.unwrap();
    assert_eq!(
        outcomes,
        vec![Ok(()), Ok(()), Ok(()), Err(TxError::ExceedsBlockGasLimit), Err(TxError::Invalid("empty transaction".into()))]
    );
    assert_eq!(streamer.get_message_count().unwrap(), 2);
    assert_eq!(engine.head_message_count().await.unwrap(), 2);
    assert!(streamer.result_at_message_index(1).unwrap().is_some());
}

#[tokio::test]
async fn revert_filter_keeps_reverting_tx_out_of_the_block() {
    let (_dir, streamer, _) = harness(1_000_000);
    let hooks = RevertGasReject { max_revert_gas: 0 };
    let outcomes = streamer.sequence_transactions(&header(1), &[vec![0, 1], vec![1, 1]], &hooks).await.unwrap();
    assert!(matches!(outcomes[0], Err(TxError::Filtered(_))));
    assert_eq!(outcomes[1], Ok(()));
    let msg = streamer.get_message(0).unwrap();
    assert_eq!(msg.message.l2msg, [&[4u8][..], &[1, 1]].concat());
}

struct Lockout {
    allow: bool,
    seen: Mutex<Vec<u64>>,
}

#[async_trait::async_trait]
impl SequencingLockout for Lockout {
    async fn sequencing_message(&self, pos: u64, _msg: &MessageWithMetadata) -> anyhow::Result<()> {
        if !self.allow {
            anyhow::bail!("not the chosen sequencer");
        }
        self.seen.lock().unwrap().push(pos);
        Ok(())
    }
}

#[tokio::test]
async fn lockout_gates_local_sequencing() {
    let (_dir, streamer, engine) = harness(1_000_000);
    streamer.set_coordinator(Arc::new(Lockout { allow: false, seen: Mutex::new(vec![]) }));
    assert!(streamer.sequence_transactions(&header(1), &[vec![1]], &NoopHooks).await.is_err());
    assert_eq!(streamer.get_message_count().unwrap(), 0);
    assert_eq!(engine.head_message_count().await.unwrap(), 0);

    let lockout = Arc::new(Lockout { allow: true, seen: Mutex::new(vec![]) });
    streamer.set_coordinator(lockout.clone());
    streamer.sequence_transactions(&header(1), &[vec![1]], &NoopHooks).await.unwrap();
    streamer.sequence_transactions(&header(2), &[vec![2]], &NoopHooks).await.unwrap();
    assert_eq!(*lockout.seen.lock().unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn sequencing_waits_for_production_to_catch_up() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init")]).await.unwrap();
    let err = streamer.sequence_transactions(&header(1), &[vec![1]], &NoopHooks).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::ExecutionBehind { produced: 0, messages: 1 }));
}

#[tokio::test]
async fn delayed_sequencing_checks_position() {
    let (_dir, streamer, _) = harness(1_000_000);
    streamer.add_messages(0, false, vec![mk_msg(1, b"init")]).await.unwrap();
    let delayed = L1IncomingMessage {
        header: L1IncomingMessageHeader { request_id: Some(B256::with_last_byte(1)), ..header(3) },
        l2msg: b"deposit".to_vec(),
        batch_gas_cost: None,
    };
    let err = streamer.sequence_delayed_messages(vec![delayed.clone()], 2).await.unwrap_err();
    assert!(matches!(streamer_err(&err), StreamerError::DelayedSequenceMismatch { expected: 1, got: 2 }));

    streamer.sequence_delayed_messages(vec![delayed], 1).await.unwrap();
    assert_eq!(streamer.get_message(1).unwrap().delayed_messages_read, 2);
}

#[tokio::test]
async fn sync_broadcast_respects_threshold() {
    let (_dir, streamer, _) = harness(1_000_000);
    let (tx, mut rx) = tokio::sync::broadcast::channel(16);
    streamer.set_broadcaster(Arc::new(tx));

    let msgs: Vec<_> = (0..5u8).map(|i| mk_msg(1, &[i])).collect();
    streamer.broadcast_during_sync(100, &msgs, 200);
    assert!(rx.try_recv().is_err());

    streamer.broadcast_during_sync(195, &msgs, 199);
    assert_eq!(rx.try_recv().unwrap().0, 195);

    streamer.set_synced(true);
    streamer.broadcast_during_sync(100, &msgs[..1], 200);
    let mut got = Vec::new();
    while let Ok((idx, _)) = rx.try_recv() {
        got.push(idx);
    }
    assert_eq!(got, vec![196, 197, 198, 199, 100]);
}
