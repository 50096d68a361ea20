use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use inbox_bridge::abi::{dynamic_bytes, selector, word_address, word_u64};
use inbox_bridge::selectors::SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rollup_batch_poster::{
    encode_add_batch, BatchPoster, BatchPosterConfig, BatchSubmitter, PostedBatch, SegmentsError,
};
use rollup_db_sled::SledDb;
use rollup_inbox::multiplexer::InboxMultiplexerDemux;
use rollup_inbox::tracker::InboxTracker;
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_INITIALIZE, L1_MESSAGE_TYPE_L2_MESSAGE,
};
use rollup_primitives::message::MessageWithMetadata;
use rollup_streamer::engine::HashChainEngine;
use rollup_streamer::{StreamerConfig, TransactionStreamer};

#[derive(Default)]
struct RecordingSubmitter {
    posted: Mutex<Vec<PostedBatch>>,
}

#[async_trait]
impl BatchSubmitter for RecordingSubmitter {
    async fn submit(&self, batch: &PostedBatch) -> anyhow::Result<B256> {
        self.posted.lock().unwrap().push(batch.clone());
        Ok(B256::from(U256::from(batch.seq_num + 1)))
    }
}

fn message(kind: u8, timestamp: u64, delayed_read: u64, payload: &[u8]) -> MessageWithMetadata {
    MessageWithMetadata {
        message: L1IncomingMessage {
            header: L1IncomingMessageHeader {
                kind,
                poster: Address::ZERO,
                block_number: 50,
                timestamp,
                request_id: None,
                l1_base_fee: U256::ZERO,
            },
            l2msg: payload.to_vec(),
            batch_gas_cost: None,
        },
        delayed_messages_read: delayed_read,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    streamer: Arc<TransactionStreamer>,
    submitter: Arc<RecordingSubmitter>,
    poster: BatchPoster,
}

fn harness(config: BatchPosterConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(SledDb::open(dir.path()).unwrap());
    let streamer = Arc::new(TransactionStreamer::new(
        db.clone(),
        Arc::new(HashChainEngine::new(30_000_000)),
        StreamerConfig::default(),
    ));
    let tracker = Arc::new(InboxTracker::new(db, streamer.clone(), Arc::new(InboxMultiplexerDemux)));
    tracker.initialize().unwrap();
    let submitter = Arc::new(RecordingSubmitter::default());
    let poster = BatchPoster::new(streamer.clone(), tracker, submitter.clone(), config).unwrap();
    Harness { _dir: dir, streamer, submitter, poster }
}

#[tokio::test]
async fn partial_batch_waits_for_max_delay() {
    let h = harness(BatchPosterConfig { max_delay: Duration::from_secs(60), ..Default::default() });
    h.streamer
        .add_messages(
            0,
            false,
            vec![
                message(L1_MESSAGE_TYPE_INITIALIZE, 1_000, 1, b"init"),
                message(L1_MESSAGE_TYPE_L2_MESSAGE, 1_000, 1, b"a"),
                message(L1_MESSAGE_TYPE_L2_MESSAGE, 1_005, 1, b"b"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(h.poster.post_once(1_010).await.unwrap(), None);
    assert!(h.submitter.posted.lock().unwrap().is_empty());

    assert!(h.poster.post_once(1_061).await.unwrap().is_some());
    {
        let posted = h.submitter.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].seq_num, 0);
        assert_eq!(posted[0].prev_message_count, 0);
        assert_eq!(posted[0].new_message_count, 3);
        assert_eq!(posted[0].after_delayed_messages_read, 1);
        assert_eq!(posted[0].data[0], 0x01);
    }

    // The local position runs ahead of the tracker until the batch is read back.
    assert_eq!(h.poster.post_once(2_000).await.unwrap(), None);

    h.streamer
        .add_messages(
            3,
            false,
            vec![message(L1_MESSAGE_TYPE_L2_MESSAGE, 2_500, 1, b"c"), message(L1_MESSAGE_TYPE_L2_MESSAGE, 2_501, 1, b"d")],
        )
        .await
        .unwrap();
    assert!(h.poster.post_once(3_000).await.unwrap().is_some());
    let posted = h.submitter.posted.lock().unwrap();
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[1].seq_num, 1);
    assert_eq!(posted[1].prev_message_count, 3);
    assert_eq!(posted[1].new_message_count, 5);
}

#[tokio::test]
async fn full_batches_post_without_waiting() {
    let config = BatchPosterConfig { max_size: 40 + 400, max_delay: Duration::from_secs(3600), ..Default::default() };
    let h = harness(config.clone());
    let mut rng = StdRng::seed_from_u64(7);
    let mut msgs = vec![message(L1_MESSAGE_TYPE_INITIALIZE, 100, 1, b"init")];
    for i in 0..12 {
        let mut payload = vec![0u8; 150];
        rng.fill_bytes(&mut payload);
        msgs.push(message(L1_MESSAGE_TYPE_L2_MESSAGE, 100 + i, 1, &payload));
    }
    h.streamer.add_messages(0, false, msgs).await.unwrap();

    assert!(h.poster.post_once(100).await.unwrap().is_some());
    assert!(h.poster.backlog() > 0);
    assert!(h.poster.post_once(100).await.unwrap().is_some());

    let posted = h.submitter.posted.lock().unwrap();
    assert_eq!(posted.len(), 2);
    assert!(posted[0].new_message_count < 13);
    assert_eq!(posted[1].prev_message_count, posted[0].new_message_count);
    for batch in posted.iter() {
        assert!(batch.data.len() <= config.payload_size_limit());
    }
}

#[tokio::test]
async fn oversized_message_stops_posting_at_its_position() {
    let h = harness(BatchPosterConfig { max_size: 40 + 100, max_delay: Duration::ZERO, ..Default::default() });
    let mut payload = vec![0u8; 400];
    StdRng::seed_from_u64(11).fill_bytes(&mut payload);
    h.streamer
        .add_messages(
            0,
            false,
            vec![message(L1_MESSAGE_TYPE_INITIALIZE, 100, 1, b"init"), message(L1_MESSAGE_TYPE_L2_MESSAGE, 101, 1, &payload)],
        )
        .await
        .unwrap();

    assert!(h.poster.post_once(200).await.unwrap().is_some());
    assert_eq!(h.submitter.posted.lock().unwrap()[0].new_message_count, 1);

    for _ in 0..2 {
        let err = h.poster.post_once(200).await.unwrap_err();
        match err.downcast_ref::<SegmentsError>() {
            Some(SegmentsError::MessageTooLarge { size, limit }) => assert!(size > limit),
            other => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(h.submitter.posted.lock().unwrap().len(), 1);
}

#[test]
fn add_batch_calldata_layout() {
    let batch = PostedBatch {
        seq_num: 9,
        data: vec![0x01, 0xaa, 0xbb],
        after_delayed_messages_read: 4,
        prev_message_count: 100,
        new_message_count: 120,
    };
    let refunder = Address::repeat_byte(0x42);
    let calldata = encode_add_batch(&batch, refunder);

    assert_eq!(calldata[..4], selector(SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN));
    let args = &calldata[4..];
    assert_eq!(word_u64(args, 0).unwrap(), 9);
    assert_eq!(dynamic_bytes(args, 1).unwrap(), batch.data);
    assert_eq!(word_u64(args, 2).unwrap(), 4);
    assert_eq!(word_address(args, 3).unwrap(), refunder);
    assert_eq!(word_u64(args, 4).unwrap(), 100);
    assert_eq!(word_u64(args, 5).unwrap(), 120);
}
