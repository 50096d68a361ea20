use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use brotli::CompressorWriter;
use inbox_bridge::types::{DelayedInboxMessage, SequencerInboxBatch, TimeBounds};
use rollup_db_sled::SledDb;
use rollup_inbox::multiplexer::{InboxMultiplexerDemux, BATCH_SEGMENT_KIND_L2_MESSAGE};
use rollup_inbox::tracker::InboxTracker;
use rollup_primitives::accumulator::hash_after;
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_INITIALIZE, L1_MESSAGE_TYPE_L2_MESSAGE,
};
use rollup_streamer::engine::{ExecEngine, HashChainEngine};
use rollup_streamer::{StreamerConfig, TransactionStreamer};
use tokio_util::sync::CancellationToken;

fn delayed(seq: u64, kind: u8, before: B256, payload: &[u8]) -> DelayedInboxMessage {
    DelayedInboxMessage {
        block_hash: B256::ZERO,
        before_inbox_acc: before,
        message: L1IncomingMessage {
            header: L1IncomingMessageHeader {
                kind,
                poster: Address::repeat_byte(0x0a),
                block_number: 100 + seq,
                timestamp: 1_000 + seq,
                request_id: Some(B256::from(U256::from(seq))),
                l1_base_fee: U256::from(7),
            },
            l2msg: payload.to_vec(),
            batch_gas_cost: None,
        },
        parent_chain_block_number: 100 + seq,
    }
}

fn l2_payload(messages: &[&[u8]]) -> Vec<u8> {
    let mut rlp_concat = Vec::new();
    for m in messages {
        let mut seg = vec![BATCH_SEGMENT_KIND_L2_MESSAGE];
        seg.extend_from_slice(m);
        rlp_concat.extend_from_slice(&alloy_rlp::encode(seg.as_slice()));
    }
    let mut compressed = Vec::new();
    {
        let mut w = CompressorWriter::new(&mut compressed, 4096, 5, 22);
        w.write_all(&rlp_concat).unwrap();
        w.flush().unwrap();
    }
    let mut out = vec![0x01];
    out.extend_from_slice(&compressed);
    out
}

fn seq_batch(seq: u64, before: B256, after_delayed: u64, delayed_acc: B256, payload: &[u8]) -> SequencerInboxBatch {
    let mut b = SequencerInboxBatch {
        sequence_number: seq,
        before_inbox_acc: before,
        after_inbox_acc: hash_after(before, &[seq as u8, payload.len() as u8]),
        after_delayed_count: after_delayed,
        after_delayed_acc: delayed_acc,
        time_bounds: TimeBounds { min_timestamp: 0, max_timestamp: 5_000, min_block_number: 0, max_block_number: 500 },
        parent_chain_block_number: 200 + seq,
        ..Default::default()
    };
    b.set_payload(payload);
    b
}

async fn wait_for_head(engine: &HashChainEngine, count: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.head_message_count().await.unwrap() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("block production did not reach the expected head");
}

#[tokio::test]
async fn delayed_reorg_rolls_back_produced_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(SledDb::open(dir.path()).unwrap());
    let engine = Arc::new(HashChainEngine::new(30_000_000));
    let config = StreamerConfig { execute_message_loop_delay: Duration::from_millis(5) };
    let streamer = Arc::new(TransactionStreamer::new(db.clone(), engine.clone(), config));
    let tracker = InboxTracker::new(db, streamer.clone(), Arc::new(InboxMultiplexerDemux));
    tracker.initialize().unwrap();
    let cancel = CancellationToken::new();
    let production = streamer.clone().start(cancel.clone());

    let d0 = delayed(0, L1_MESSAGE_TYPE_INITIALIZE, B256::ZERO, b"init");
    let acc0 = d0.after_inbox_acc();
    let d1 = delayed(1, L1_MESSAGE_TYPE_L2_MESSAGE, acc0, b"user");
    let acc1 = d1.after_inbox_acc();
    tracker.add_delayed_messages(vec![d0, d1], false).await.unwrap();

    let b0 = seq_batch(0, B256::ZERO, 1, acc0, &[]);
    let b1 = seq_batch(1, b0.after_inbox_acc, 2, acc1, &[]);
    let b2 = seq_batch(2, b1.after_inbox_acc, 2, acc1, &[]);
    tracker.add_sequencer_batches(vec![b0.clone(), b1, b2]).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 3);
    wait_for_head(&engine, 3).await;
    let genesis = streamer.result_at_message_index(0).unwrap().unwrap();
    let old_second = streamer.result_at_message_index(1).unwrap().unwrap();

    tracker.reorg_delayed_to(1, true).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 1);
    assert_eq!(tracker.get_delayed_count().unwrap(), 1);
    assert_eq!(tracker.get_batch_count().unwrap(), 1);
    assert_eq!(engine.head_message_count().await.unwrap(), 1);
    assert_eq!(engine.block_hashes(), vec![genesis.block_hash]);
    assert!(streamer.result_at_message_index(1).unwrap().is_none());
    assert!(streamer.result_at_message_index(2).unwrap().is_none());

    let fixed = seq_batch(1, b0.after_inbox_acc, 1, acc0, &l2_payload(&[b"replacement"]));
    tracker.add_sequencer_batches(vec![fixed]).await.unwrap();
    assert_eq!(streamer.get_message_count().unwrap(), 2);
    assert_eq!(tracker.get_batch_count().unwrap(), 2);
    wait_for_head(&engine, 2).await;

    let new_second = streamer.result_at_message_index(1).unwrap().unwrap();
    assert_ne!(new_second.block_hash, old_second.block_hash);
    assert_eq!(streamer.result_at_message_index(0).unwrap().unwrap(), genesis);
    assert_eq!(streamer.get_message(1).unwrap().message.l2msg, b"replacement");

    cancel.cancel();
    production.await.unwrap();
}
