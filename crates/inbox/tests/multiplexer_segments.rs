use std::collections::HashMap;
use std::io::Write;

use alloy_primitives::{Address, B256, U256};
use alloy_rlp::encode;
use brotli::CompressorWriter;
use inbox_bridge::types::SequencerInboxBatch;
use rollup_inbox::multiplexer::{
    parse_sequencer_message, BatchDemultiplexer, DelayedMessageSource, InboxMultiplexerDemux,
    BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER, BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP,
    BATCH_SEGMENT_KIND_DELAYED_MESSAGES, BATCH_SEGMENT_KIND_L2_MESSAGE,
};
use rollup_primitives::batch::SequencerMessageHeader;
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, L1_MESSAGE_TYPE_END_OF_BLOCK, L1_MESSAGE_TYPE_INVALID,
    L1_MESSAGE_TYPE_L2_MESSAGE,
};

fn header(min_ts: u64, max_ts: u64, min_l1: u64, max_l1: u64, after_delayed: u64) -> Vec<u8> {
    SequencerMessageHeader {
        min_timestamp: min_ts,
        max_timestamp: max_ts,
        min_l1_block: min_l1,
        max_l1_block: max_l1,
        after_delayed_messages: after_delayed,
    }
    .encode()
    .to_vec()
}

fn seg(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut v = vec![kind];
    v.extend_from_slice(body);
    v
}

fn int_seg(kind: u8, v: u64) -> Vec<u8> {
    seg(kind, &encode(v))
}

fn compressed_batch(hdr: Vec<u8>, segments: &[Vec<u8>]) -> Vec<u8> {
    let mut rlp_concat = Vec::new();
    for s in segments {
        rlp_concat.extend_from_slice(&encode(s.as_slice()));
    }
    let mut compressed = Vec::new();
    {
        let mut w = CompressorWriter::new(&mut compressed, 4096, 5, 22);
        w.write_all(&rlp_concat).unwrap();
        w.flush().unwrap();
    }
    let mut data = hdr;
    data.push(0x01);
    data.extend_from_slice(&compressed);
    data
}

fn batch(seq: u64, serialized: Vec<u8>) -> SequencerInboxBatch {
    SequencerInboxBatch { sequence_number: seq, serialized, ..Default::default() }
}

struct MapDelayed(HashMap<u64, L1IncomingMessage>);

impl DelayedMessageSource for MapDelayed {
    fn read_delayed_message(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage> {
        self.0.get(&seq_num).cloned().ok_or_else(|| anyhow::anyhow!("no delayed message {seq_num}"))
    }
}

fn delayed(seq: u64) -> L1IncomingMessage {
    L1IncomingMessage {
        header: L1IncomingMessageHeader {
            kind: L1_MESSAGE_TYPE_END_OF_BLOCK,
            poster: Address::repeat_byte(0x42),
            block_number: 5,
            timestamp: 50,
            request_id: Some(B256::with_last_byte(seq as u8)),
            l1_base_fee: U256::ZERO,
        },
        l2msg: vec![],
        batch_gas_cost: None,
    }
}

#[test]
fn parses_brotli_compressed_segments() {
    let s = seg(BATCH_SEGMENT_KIND_L2_MESSAGE, &[0xDE, 0xAD, 0xBE, 0xEF]);
    let data = compressed_batch(header(1, 2, 3, 4, 0), &[s.clone()]);

    let parsed = parse_sequencer_message(0, &data).expect("parse ok");
    assert_eq!(parsed.header.min_timestamp, 1);
    assert_eq!(parsed.header.max_l1_block, 4);
    assert_eq!(parsed.segments, vec![s]);
}

#[test]
fn garbage_body_parses_to_no_segments() {
    let mut data = header(0, 10, 0, 10, 3);
    data.extend_from_slice(&[0x01, 0xff, 0xff, 0xff]);
    let parsed = parse_sequencer_message(7, &data).unwrap();
    assert!(parsed.segments.is_empty());
    assert_eq!(parsed.header.after_delayed_messages, 3);
}

#[test]
fn demux_applies_advances_and_clamps_to_bounds() {
    let segments = vec![
        int_seg(BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP, 1_000),
        int_seg(BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER, 20),
        seg(BATCH_SEGMENT_KIND_L2_MESSAGE, b"first"),
        int_seg(BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP, 5_000),
        seg(BATCH_SEGMENT_KIND_L2_MESSAGE, b"second"),
    ];
    let data = compressed_batch(header(0, 2_000, 10, 100, 0), &segments);
    let delayed = MapDelayed(HashMap::new());
    let out = InboxMultiplexerDemux.demultiplex(&[batch(4, data)], 0, &delayed).unwrap();

    assert_eq!(out.len(), 2);
    let (seq0, m0) = &out[0];
    assert_eq!(*seq0, 4);
    assert_eq!(m0.message.header.kind, L1_MESSAGE_TYPE_L2_MESSAGE);
    assert_eq!(m0.message.header.timestamp, 1_000);
    assert_eq!(m0.message.header.block_number, 20);
    assert_eq!(m0.message.l2msg, b"first");
    // 6000 is past the batch's max timestamp.
    assert_eq!(out[1].1.message.header.timestamp, 2_000);
    assert_eq!(out[1].1.message.l2msg, b"second");
}

#[test]
fn demux_reads_owed_delayed_messages_and_tags_batches() {
    let delayed_src = MapDelayed((0..3).map(|i| (i, delayed(i))).collect());
    let first = compressed_batch(
        header(0, u64::MAX, 0, u64::MAX, 2),
        &[seg(BATCH_SEGMENT_KIND_DELAYED_MESSAGES, &[]), seg(BATCH_SEGMENT_KIND_L2_MESSAGE, b"tx")],
    );
    // Header-only batch: one more delayed message, no segments at all.
    let second = header(0, u64::MAX, 0, u64::MAX, 3);
    // Nothing owed and nothing to say: a single invalid placeholder.
    let third = header(0, 9, 0, 9, 3);

    let out = InboxMultiplexerDemux
        .demultiplex(&[batch(0, first), batch(1, second), batch(2, third)], 0, &delayed_src)
        .unwrap();

    let summary: Vec<(u64, u64)> = out.iter().map(|(s, m)| (*s, m.delayed_messages_read)).collect();
    assert_eq!(summary, vec![(0, 1), (0, 1), (0, 2), (1, 3), (2, 3)]);
    assert_eq!(out[0].1.message, delayed(0));
    assert_eq!(out[1].1.message.l2msg, b"tx");
    assert_eq!(out[2].1.message, delayed(1));
    assert_eq!(out[3].1.message, delayed(2));
    assert_eq!(out[4].1.message.header.kind, L1_MESSAGE_TYPE_INVALID);
}

#[test]
fn demux_propagates_missing_delayed_message() {
    let delayed_src = MapDelayed(HashMap::new());
    let data = header(0, u64::MAX, 0, u64::MAX, 1);
    assert!(InboxMultiplexerDemux.demultiplex(&[batch(0, data)], 0, &delayed_src).is_err());
}
