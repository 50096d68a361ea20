use std::io::Read;

use alloy_primitives::U256;
use alloy_rlp::Decodable;
use inbox_bridge::types::SequencerInboxBatch;
use rollup_primitives::batch::SequencerMessageHeader;
use rollup_primitives::l1::{
    L1IncomingMessage, L1IncomingMessageHeader, BATCH_POSTER_ADDRESS, L1_MESSAGE_TYPE_L2_MESSAGE,
};
use rollup_primitives::message::MessageWithMetadata;
use tracing::warn;

pub const BATCH_SEGMENT_KIND_L2_MESSAGE: u8 = 0;
pub const BATCH_SEGMENT_KIND_L2_MESSAGE_BROTLI: u8 = 1;
pub const BATCH_SEGMENT_KIND_DELAYED_MESSAGES: u8 = 2;
pub const BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP: u8 = 3;
pub const BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER: u8 = 4;

/// First payload byte of a brotli-compressed segment stream.
pub const BROTLI_MESSAGE_HEADER_BYTE: u8 = 0x01;

pub const MAX_DECOMPRESSED_LEN: usize = 16 * 1024 * 1024;
pub const MAX_SEGMENTS_PER_SEQUENCER_MESSAGE: usize = 100 * 1024;

#[derive(Clone, Debug, Default)]
pub struct SequencerMessage {
    pub header: SequencerMessageHeader,
    pub segments: Vec<Vec<u8>>,
}

/// Decodes the RLP list of segments out of a decompressed batch body.
pub fn decode_segments(mut data: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut segments = Vec::new();
    while !data.is_empty() {
        if segments.len() >= MAX_SEGMENTS_PER_SEQUENCER_MESSAGE {
            anyhow::bail!("too many segments in sequencer message");
        }
        let seg = alloy_rlp::Header::decode_bytes(&mut data, false)?;
        segments.push(seg.to_vec());
    }
    Ok(segments)
}

pub fn decompress_brotli(data: &[u8], limit: usize) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, 4096).take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        anyhow::bail!("decompressed batch exceeds {limit} bytes");
    }
    Ok(out)
}

/// Splits a serialized batch into its header and segments. An undecodable body
/// yields no segments: the batch then only advances the delayed inbox.
pub fn parse_sequencer_message(batch_num: u64, data: &[u8]) -> anyhow::Result<SequencerMessage> {
    let (header, payload) = SequencerMessageHeader::decode(data)?;
    let mut segments = Vec::new();
    match payload.first() {
        None => {}
        Some(&BROTLI_MESSAGE_HEADER_BYTE) => {
            match decompress_brotli(&payload[1..], MAX_DECOMPRESSED_LEN).and_then(|d| decode_segments(&d)) {
                Ok(s) => segments = s,
                Err(err) => warn!(batch_num, %err, "failed to decode sequencer message segments"),
            }
        }
        Some(kind) => warn!(batch_num, kind, "unknown sequencer message payload kind"),
    }
    Ok(SequencerMessage { header, segments })
}

/// Source of serialized batches and delayed messages for the multiplexer.
pub trait InboxBackend {
    fn peek_sequencer_inbox(&mut self) -> anyhow::Result<Vec<u8>>;
    fn get_sequencer_inbox_position(&self) -> u64;
    fn advance_sequencer_inbox(&mut self);

    fn get_position_within_message(&self) -> u64;
    fn set_position_within_message(&mut self, pos: u64);

    fn read_delayed_inbox(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage>;
}

/// Turns a stream of sequencer batches into individual messages, pulling delayed
/// messages in as the batches demand them.
pub struct InboxMultiplexer<B: InboxBackend> {
    backend: B,
    delayed_messages_read: u64,
    cached_msg: Option<SequencerMessage>,
    cached_segment_num: u64,
    cached_segment_timestamp: u64,
    cached_segment_block_number: u64,
    cached_submessage_number: u64,
}

impl<B: InboxBackend> InboxMultiplexer<B> {
    pub fn new(backend: B, delayed_messages_read: u64) -> Self {
        Self {
            backend,
            delayed_messages_read,
            cached_msg: None,
            cached_segment_num: 0,
            cached_segment_timestamp: 0,
            cached_segment_block_number: 0,
            cached_submessage_number: 0,
        }
    }

    pub fn delayed_messages_read(&self) -> u64 {
        self.delayed_messages_read
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn advance_seq_msg(&mut self) {
        if let Some(seq) = &self.cached_msg {
            self.delayed_messages_read = self.delayed_messages_read.max(seq.header.after_delayed_messages);
        }
        self.backend.set_position_within_message(0);
        self.backend.advance_sequencer_inbox();
        self.cached_msg = None;
        self.cached_segment_num = 0;
        self.cached_segment_timestamp = 0;
        self.cached_segment_block_number = 0;
        self.cached_submessage_number = 0;
    }

    fn advance_submsg(&mut self) {
        let prev = self.backend.get_position_within_message();
        self.backend.set_position_within_message(prev + 1);
    }

    /// True when nothing after the current segment would produce another message.
    fn is_cached_segment_last(&self) -> bool {
        let Some(seq) = &self.cached_msg else { return true };
        if self.delayed_messages_read < seq.header.after_delayed_messages {
            return false;
        }
        !seq.segments.iter().skip(self.cached_segment_num as usize + 1).any(|seg| {
            matches!(
                seg.first(),
                Some(&BATCH_SEGMENT_KIND_L2_MESSAGE)
                    | Some(&BATCH_SEGMENT_KIND_L2_MESSAGE_BROTLI)
                    | Some(&BATCH_SEGMENT_KIND_DELAYED_MESSAGES)
            )
        })
    }

    /// Returns the next message. Each call consumes exactly one message; the batch it
    /// belongs to is the one at `backend().get_sequencer_inbox_position()` before the call.
    pub fn pop(&mut self) -> anyhow::Result<MessageWithMetadata> {
        if self.cached_msg.is_none() {
            let bytes = self.backend.peek_sequencer_inbox()?;
            let seqnum = self.backend.get_sequencer_inbox_position();
            self.cached_msg = Some(parse_sequencer_message(seqnum, &bytes)?);
        }
        let res = self.get_next_msg();
        if self.is_cached_segment_last() {
            self.advance_seq_msg();
        } else {
            self.advance_submsg();
        }
        res
    }

    fn get_next_msg(&mut self) -> anyhow::Result<MessageWithMetadata> {
        let target_submessage = self.backend.get_position_within_message();
        let Some(seq) = &self.cached_msg else { anyhow::bail!("no sequencer message cached") };
        let mut segment_num = self.cached_segment_num;
        let mut timestamp = self.cached_segment_timestamp;
        let mut block_number = self.cached_segment_block_number;
        let mut submessage_number = self.cached_submessage_number;

        while let Some(seg) = seq.segments.get(segment_num as usize) {
            match seg.first() {
                None => {
                    segment_num += 1;
                }
                Some(&kind)
                    if kind == BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP
                        || kind == BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER =>
                {
                    match u64::decode(&mut &seg[1..]) {
                        Ok(v) if kind == BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP => timestamp = timestamp.saturating_add(v),
                        Ok(v) => block_number = block_number.saturating_add(v),
                        Err(err) => warn!(%err, "error parsing advancing segment"),
                    }
                    segment_num += 1;
                }
                Some(_) if submessage_number < target_submessage => {
                    segment_num += 1;
                    submessage_number += 1;
                }
                Some(_) => break,
            }
        }

        self.cached_segment_num = segment_num;
        self.cached_segment_timestamp = timestamp;
        self.cached_segment_block_number = block_number;
        self.cached_submessage_number = submessage_number;

        let header = seq.header;
        let timestamp = timestamp.clamp(header.min_timestamp, header.max_timestamp.max(header.min_timestamp));
        let block_number = block_number.clamp(header.min_l1_block, header.max_l1_block.max(header.min_l1_block));

        // Past the last segment the batch still owes its remaining delayed messages.
        let segment = seq.segments.get(segment_num as usize).cloned().unwrap_or_else(|| vec![BATCH_SEGMENT_KIND_DELAYED_MESSAGES]);
        let Some((&kind, rest)) = segment.split_first() else {
            anyhow::bail!("empty sequencer message segment");
        };

        match kind {
            BATCH_SEGMENT_KIND_L2_MESSAGE | BATCH_SEGMENT_KIND_L2_MESSAGE_BROTLI => {
                let l2msg = if kind == BATCH_SEGMENT_KIND_L2_MESSAGE_BROTLI {
                    decompress_brotli(rest, rollup_primitives::l1::MAX_L2_MESSAGE_SIZE)?
                } else {
                    rest.to_vec()
                };
                Ok(MessageWithMetadata {
                    message: L1IncomingMessage {
                        header: L1IncomingMessageHeader {
                            kind: L1_MESSAGE_TYPE_L2_MESSAGE,
                            poster: BATCH_POSTER_ADDRESS,
                            block_number,
                            timestamp,
                            request_id: None,
                            l1_base_fee: U256::ZERO,
                        },
                        l2msg,
                        batch_gas_cost: None,
                    },
                    delayed_messages_read: self.delayed_messages_read,
                })
            }
            BATCH_SEGMENT_KIND_DELAYED_MESSAGES => {
                if self.delayed_messages_read >= header.after_delayed_messages {
                    if (segment_num as usize) < seq.segments.len() {
                        warn!(
                            delayed_read = self.delayed_messages_read,
                            after = header.after_delayed_messages,
                            "attempt to read past batch delayed message count"
                        );
                    }
                    return Ok(MessageWithMetadata {
                        message: L1IncomingMessage::invalid(header.max_l1_block, header.max_timestamp),
                        delayed_messages_read: header.after_delayed_messages,
                    });
                }
                let delayed = self.backend.read_delayed_inbox(self.delayed_messages_read)?;
                self.delayed_messages_read += 1;
                Ok(MessageWithMetadata { message: delayed, delayed_messages_read: self.delayed_messages_read })
            }
            other => anyhow::bail!("bad sequencer message segment kind {other}"),
        }
    }
}

/// Reads delayed messages by sequence number.
pub trait DelayedMessageSource: Send + Sync {
    fn read_delayed_message(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage>;
}

/// Splits serialized batches into messages. The tracker only depends on this seam.
pub trait BatchDemultiplexer: Send + Sync {
    /// Returns every message of `batches` tagged with the sequence number of the batch it came from.
    fn demultiplex(
        &self,
        batches: &[SequencerInboxBatch],
        delayed_messages_read: u64,
        delayed: &dyn DelayedMessageSource,
    ) -> anyhow::Result<Vec<(u64, MessageWithMetadata)>>;
}

struct BatchSliceBackend<'a> {
    batches: &'a [SequencerInboxBatch],
    next: usize,
    position_within_message: u64,
    delayed: &'a dyn DelayedMessageSource,
}

impl InboxBackend for BatchSliceBackend<'_> {
    fn peek_sequencer_inbox(&mut self) -> anyhow::Result<Vec<u8>> {
        match self.batches.get(self.next) {
            Some(b) => Ok(b.serialized.clone()),
            None => anyhow::bail!("peeked past the last sequencer batch"),
        }
    }

    fn get_sequencer_inbox_position(&self) -> u64 {
        self.batches.get(self.next).map(|b| b.sequence_number).unwrap_or_default()
    }

    fn advance_sequencer_inbox(&mut self) {
        self.next += 1;
    }

    fn get_position_within_message(&self) -> u64 {
        self.position_within_message
    }

    fn set_position_within_message(&mut self, pos: u64) {
        self.position_within_message = pos;
    }

    fn read_delayed_inbox(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage> {
        self.delayed.read_delayed_message(seq_num)
    }
}

/// [`BatchDemultiplexer`] backed by [`InboxMultiplexer`].
#[derive(Clone, Copy, Debug, Default)]
pub struct InboxMultiplexerDemux;

impl BatchDemultiplexer for InboxMultiplexerDemux {
    fn demultiplex(
        &self,
        batches: &[SequencerInboxBatch],
        delayed_messages_read: u64,
        delayed: &dyn DelayedMessageSource,
    ) -> anyhow::Result<Vec<(u64, MessageWithMetadata)>> {
        let backend = BatchSliceBackend { batches, next: 0, position_within_message: 0, delayed };
        let mut multiplexer = InboxMultiplexer::new(backend, delayed_messages_read);
        let mut out = Vec::new();
        while multiplexer.backend().next < batches.len() {
            let seq_num = multiplexer.backend().get_sequencer_inbox_position();
            out.push((seq_num, multiplexer.pop()?));
        }
        Ok(out)
    }
}
