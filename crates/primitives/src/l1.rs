use alloy_primitives::{address, Address, B256, U256};
use alloy_rlp::{Decodable, Encodable, Header};
use anyhow::anyhow;

pub const L1_MESSAGE_TYPE_L2_MESSAGE: u8 = 3;
pub const L1_MESSAGE_TYPE_END_OF_BLOCK: u8 = 6;
pub const L1_MESSAGE_TYPE_L2_FUNDED_BY_L1: u8 = 7;
pub const L1_MESSAGE_TYPE_ROLLUP_EVENT: u8 = 8;
pub const L1_MESSAGE_TYPE_SUBMIT_RETRYABLE: u8 = 9;
pub const L1_MESSAGE_TYPE_BATCH_FOR_GAS_ESTIMATION: u8 = 10;
pub const L1_MESSAGE_TYPE_INITIALIZE: u8 = 11;
pub const L1_MESSAGE_TYPE_ETH_DEPOSIT: u8 = 12;
pub const L1_MESSAGE_TYPE_BATCH_POSTING_REPORT: u8 = 13;
pub const L1_MESSAGE_TYPE_INVALID: u8 = 0xff;

pub const L2_MESSAGE_KIND_BATCH: u8 = 3;
pub const L2_MESSAGE_KIND_SIGNED_TX: u8 = 4;

/// Upper bound on the L2 payload of a single message.
pub const MAX_L2_MESSAGE_SIZE: usize = 256 * 1024;

/// Poster recorded on messages that were demultiplexed out of a sequencer batch.
pub const BATCH_POSTER_ADDRESS: Address = address!("a4b000000000000000000073657175656e636572");

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct L1IncomingMessageHeader {
    pub kind: u8,
    pub poster: Address,
    pub block_number: u64,
    pub timestamp: u64,
    pub request_id: Option<B256>,
    pub l1_base_fee: U256,
}

impl L1IncomingMessageHeader {
    /// Delayed inbox sequence number carried in the request id.
    pub fn seq_num(&self) -> anyhow::Result<u64> {
        let Some(req) = self.request_id else { return Err(anyhow!("no requestId")) };
        let n = U256::from_be_bytes(req.0);
        if n > U256::from(u64::MAX) {
            return Err(anyhow!("requestId {req} does not fit a sequence number"));
        }
        Ok(n.to::<u64>())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct L1IncomingMessage {
    pub header: L1IncomingMessageHeader,
    pub l2msg: Vec<u8>,
    pub batch_gas_cost: Option<u64>,
}

impl L1IncomingMessage {
    /// Placeholder produced when a batch asks for more delayed messages than it declared.
    pub fn invalid(block_number: u64, timestamp: u64) -> Self {
        Self {
            header: L1IncomingMessageHeader {
                kind: L1_MESSAGE_TYPE_INVALID,
                poster: Address::ZERO,
                block_number,
                timestamp,
                request_id: None,
                l1_base_fee: U256::ZERO,
            },
            l2msg: Vec::new(),
            batch_gas_cost: None,
        }
    }

    /// Equality that ignores the batch gas cost when either side lacks it.
    /// The cost is filled in lazily, so a message without it is not a conflicting copy.
    pub fn equals_ignoring_missing_gas_cost(&self, other: &Self) -> bool {
        if self.batch_gas_cost.is_some() && other.batch_gas_cost.is_some() {
            return self == other;
        }
        self.header == other.header && self.l2msg == other.l2msg
    }
}

/// Builds the L2 payload for a locally sequenced block from the transactions that were included.
/// A single transaction is sent as-is; several are wrapped in a length-prefixed batch.
pub fn l2_message_from_txes<'a, I>(txes: I) -> anyhow::Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let txes: Vec<&[u8]> = txes.into_iter().collect();
    let mut out = Vec::new();
    if let [single] = txes.as_slice() {
        out.push(L2_MESSAGE_KIND_SIGNED_TX);
        out.extend_from_slice(single);
    } else {
        out.push(L2_MESSAGE_KIND_BATCH);
        for tx in txes {
            out.extend_from_slice(&(tx.len() as u64 + 1).to_be_bytes());
            out.push(L2_MESSAGE_KIND_SIGNED_TX);
            out.extend_from_slice(tx);
        }
    }
    if out.len() > MAX_L2_MESSAGE_SIZE {
        return Err(anyhow!("l2message too long: {} bytes", out.len()));
    }
    Ok(out)
}

fn request_id_length(req: &Option<B256>) -> usize {
    req.map(|r| r.length()).unwrap_or(1)
}

impl L1IncomingMessageHeader {
    fn payload_length(&self) -> usize {
        self.kind.length()
            + self.poster.length()
            + self.block_number.length()
            + self.timestamp.length()
            + request_id_length(&self.request_id)
            + self.l1_base_fee.length()
    }
}

impl Encodable for L1IncomingMessageHeader {
    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.length() + payload_length
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        self.kind.encode(out);
        self.poster.encode(out);
        self.block_number.encode(out);
        self.timestamp.encode(out);
        match self.request_id {
            Some(req) => req.encode(out),
            None => out.put_u8(alloy_rlp::EMPTY_LIST_CODE),
        }
        self.l1_base_fee.encode(out);
    }
}

impl Decodable for L1IncomingMessageHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = Header::decode(buf)?;
        if !payload.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < payload.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let mut bytes = &buf[..payload.payload_length];
        let kind = u8::decode(&mut bytes)?;
        let poster = Address::decode(&mut bytes)?;
        let block_number = u64::decode(&mut bytes)?;
        let timestamp = u64::decode(&mut bytes)?;
        let request_id = match bytes.first() {
            Some(&alloy_rlp::EMPTY_LIST_CODE) => {
                bytes = &bytes[1..];
                None
            }
            Some(_) => Some(B256::decode(&mut bytes)?),
            None => return Err(alloy_rlp::Error::InputTooShort),
        };
        let l1_base_fee = U256::decode(&mut bytes)?;
        *buf = &buf[payload.payload_length..];
        Ok(Self { kind, poster, block_number, timestamp, request_id, l1_base_fee })
    }
}

impl L1IncomingMessage {
    fn payload_length(&self) -> usize {
        self.header.length() + self.l2msg.as_slice().length() + self.batch_gas_cost.map(|g| g.length()).unwrap_or(0)
    }
}

impl Encodable for L1IncomingMessage {
    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        Header { list: true, payload_length }.length() + payload_length
    }

    fn encode(&self, out: &mut dyn bytes::BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        self.header.encode(out);
        self.l2msg.as_slice().encode(out);
        if let Some(g) = self.batch_gas_cost {
            g.encode(out);
        }
    }
}

impl Decodable for L1IncomingMessage {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = Header::decode(buf)?;
        if !payload.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < payload.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let mut bytes = &buf[..payload.payload_length];
        let header = L1IncomingMessageHeader::decode(&mut bytes)?;
        let l2msg = Header::decode_bytes(&mut bytes, false)?.to_vec();
        let batch_gas_cost = if bytes.is_empty() { None } else { Some(u64::decode(&mut bytes)?) };
        *buf = &buf[payload.payload_length..];
        Ok(Self { header, l2msg, batch_gas_cost })
    }
}
