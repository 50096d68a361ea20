use std::io::Write;

use brotli::CompressorWriter;
use rollup_inbox::multiplexer::{
    BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER, BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP,
    BATCH_SEGMENT_KIND_DELAYED_MESSAGES, BATCH_SEGMENT_KIND_L2_MESSAGE, BROTLI_MESSAGE_HEADER_BYTE,
    MAX_DECOMPRESSED_LEN, MAX_SEGMENTS_PER_SEQUENCER_MESSAGE,
};
use rollup_primitives::message::MessageWithMetadata;
use tracing::debug;

const BROTLI_WINDOW: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SegmentsError {
    #[error("batch segments already closed")]
    AlreadyClosed,
    #[error("attempted to add delayed message {got} after {have}")]
    DelayedGap { have: u64, got: u64 },
    #[error("message {field} went backwards from {base} to {got}")]
    WentBackwards { field: &'static str, base: u64, got: u64 },
    #[error("batch size limit {0} leaves no room for data")]
    LimitTooSmall(usize),
    /// A single message does not fit any batch. The poster cannot move past it until
    /// it is restarted with a larger `max_size`.
    #[error("first message compresses to {size} bytes, above the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Output of a closed batch, ready to follow the sequencer message header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBatch {
    /// `0x01` followed by the brotli stream.
    pub data: Vec<u8>,
    /// Messages of the log covered by the batch.
    pub message_count: u64,
    /// Cumulative delayed messages read once the batch is applied.
    pub delayed_messages_read: u64,
}

#[derive(Clone, Copy, Debug)]
struct Boundary {
    segments: usize,
    delayed: u64,
}

/// Accumulates log messages into the segment stream of one batch.
///
/// Compression runs incrementally so the builder can tell when the next message
/// would push the batch past its size limit. Closing recompresses everything at
/// the recompression level.
pub struct BatchSegments {
    writer: CompressorWriter<Vec<u8>>,
    /// RLP-encoded segments in order.
    raw_segments: Vec<Vec<u8>>,
    boundaries: Vec<Boundary>,
    timestamp: u64,
    block_num: u64,
    delayed_msg: u64,
    size_limit: usize,
    recompression_level: u32,
    new_uncompressed_size: usize,
    total_uncompressed_size: usize,
    last_compressed_size: usize,
    trailing_headers: usize,
    sealed: Option<(Vec<u8>, usize)>,
    is_done: bool,
}

fn compress_segments(segments: &[Vec<u8>], level: u32) -> std::io::Result<Vec<u8>> {
    let mut writer = CompressorWriter::new(Vec::new(), BROTLI_BUFFER, level, BROTLI_WINDOW);
    for seg in segments {
        writer.write_all(seg)?;
    }
    Ok(writer.into_inner())
}

impl BatchSegments {
    /// `max_size` bounds the sealed data including its leading header byte.
    pub fn new(
        max_size: usize,
        first_delayed: u64,
        compression_level: u32,
        recompression_level: u32,
    ) -> Result<Self, SegmentsError> {
        if max_size <= 1 {
            return Err(SegmentsError::LimitTooSmall(max_size));
        }
        Ok(Self {
            writer: CompressorWriter::new(Vec::new(), BROTLI_BUFFER, compression_level, BROTLI_WINDOW),
            raw_segments: Vec::new(),
            boundaries: Vec::new(),
            timestamp: 0,
            block_num: 0,
            delayed_msg: first_delayed,
            size_limit: max_size - 1,
            recompression_level: recompression_level.max(compression_level),
            new_uncompressed_size: 0,
            total_uncompressed_size: 0,
            last_compressed_size: 0,
            trailing_headers: 0,
            sealed: None,
            is_done: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Messages accepted so far.
    pub fn message_count(&self) -> u64 {
        self.boundaries.len() as u64
    }

    pub fn delayed_messages_read(&self) -> u64 {
        self.delayed_msg
    }

    /// Appends `msg`. Returns `false` once the batch is full; the batch is then closed
    /// and the message is not part of it.
    pub fn add_message(&mut self, msg: &MessageWithMetadata) -> Result<bool, SegmentsError> {
        if self.is_done {
            return Err(SegmentsError::AlreadyClosed);
        }
        if msg.delayed_messages_read > self.delayed_msg {
            if msg.delayed_messages_read != self.delayed_msg + 1 {
                return Err(SegmentsError::DelayedGap { have: self.delayed_msg, got: msg.delayed_messages_read });
            }
            if !self.add_segment(vec![BATCH_SEGMENT_KIND_DELAYED_MESSAGES], false)? {
                return Ok(false);
            }
            self.delayed_msg += 1;
            self.push_boundary();
            return Ok(true);
        }

        let header = &msg.message.header;
        if !self.maybe_add_diff_segment(BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP, header.timestamp)? {
            return Ok(false);
        }
        if !self.maybe_add_diff_segment(BATCH_SEGMENT_KIND_ADVANCE_L1_BLOCK_NUMBER, header.block_number)? {
            return Ok(false);
        }
        let mut segment = Vec::with_capacity(msg.message.l2msg.len() + 1);
        segment.push(BATCH_SEGMENT_KIND_L2_MESSAGE);
        segment.extend_from_slice(&msg.message.l2msg);
        if !self.add_segment(segment, false)? {
            return Ok(false);
        }
        self.push_boundary();
        Ok(true)
    }

    fn push_boundary(&mut self) {
        self.boundaries.push(Boundary { segments: self.raw_segments.len(), delayed: self.delayed_msg });
    }

    fn maybe_add_diff_segment(&mut self, kind: u8, value: u64) -> Result<bool, SegmentsError> {
        let base = if kind == BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP { self.timestamp } else { self.block_num };
        if value < base {
            let field = if kind == BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP { "timestamp" } else { "block number" };
            return Err(SegmentsError::WentBackwards { field, base, got: value });
        }
        if value == base {
            return Ok(true);
        }
        let mut segment = vec![kind];
        alloy_rlp::Encodable::encode(&(value - base), &mut segment);
        if !self.add_segment(segment, true)? {
            return Ok(false);
        }
        if kind == BATCH_SEGMENT_KIND_ADVANCE_TIMESTAMP {
            self.timestamp = value;
        } else {
            self.block_num = value;
        }
        Ok(true)
    }

    fn add_segment(&mut self, segment: Vec<u8>, is_header: bool) -> Result<bool, SegmentsError> {
        if self.is_done {
            return Err(SegmentsError::AlreadyClosed);
        }
        let encoded = alloy_rlp::encode(segment.as_slice());
        self.new_uncompressed_size += encoded.len();
        self.total_uncompressed_size += encoded.len();
        self.writer.write_all(&encoded)?;
        if self.test_for_overflow(is_header)? {
            self.close()?;
            return Ok(false);
        }
        self.raw_segments.push(encoded);
        if is_header {
            self.trailing_headers += 1;
        } else {
            self.trailing_headers = 0;
        }
        Ok(true)
    }

    fn test_for_overflow(&mut self, is_header: bool) -> Result<bool, SegmentsError> {
        if self.total_uncompressed_size > MAX_DECOMPRESSED_LEN {
            return Ok(true);
        }
        if self.raw_segments.len() >= MAX_SEGMENTS_PER_SEQUENCER_MESSAGE {
            return Ok(true);
        }
        if self.last_compressed_size + self.new_uncompressed_size < self.size_limit {
            return Ok(false);
        }
        // Headers and the first message never trigger a flush.
        if is_header || self.raw_segments.len() == self.trailing_headers {
            return Ok(false);
        }
        self.writer.flush()?;
        self.last_compressed_size = self.writer.get_ref().len();
        self.new_uncompressed_size = 0;
        Ok(self.last_compressed_size >= self.size_limit)
    }

    /// Drops trailing headers and recompresses. Messages are removed from the end
    /// until the stream fits the size limit.
    fn close(&mut self) -> Result<(), SegmentsError> {
        let keep = self.raw_segments.len() - self.trailing_headers;
        self.raw_segments.truncate(keep);
        self.trailing_headers = 0;
        self.is_done = true;

        let mut included = self.boundaries.len();
        loop {
            let segments = if included == 0 { 0 } else { self.boundaries[included - 1].segments };
            let compressed = compress_segments(&self.raw_segments[..segments], self.recompression_level)?;
            if compressed.len() <= self.size_limit {
                self.raw_segments.truncate(segments);
                self.sealed = Some((compressed, included));
                return Ok(());
            }
            if included <= 1 {
                return Err(SegmentsError::MessageTooLarge { size: compressed.len(), limit: self.size_limit });
            }
            debug!(size = compressed.len(), limit = self.size_limit, "recompressed batch too large, dropping last message");
            included -= 1;
        }
    }

    /// Closes the batch. Returns `None` when it holds no message.
    pub fn close_and_get_bytes(mut self) -> Result<Option<SealedBatch>, SegmentsError> {
        if !self.is_done {
            self.close()?;
        }
        let Some((compressed, included)) = self.sealed.take() else { return Ok(None) };
        if included == 0 || self.raw_segments.is_empty() {
            return Ok(None);
        }
        let delayed_messages_read = self.boundaries[included - 1].delayed;
        let mut data = Vec::with_capacity(compressed.len() + 1);
        data.push(BROTLI_MESSAGE_HEADER_BYTE);
        data.extend_from_slice(&compressed);
        Ok(Some(SealedBatch { data, message_count: included as u64, delayed_messages_read }))
    }
}
