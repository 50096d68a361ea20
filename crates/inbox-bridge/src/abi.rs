//! Minimal ABI word handling for the handful of calls and events the inbox needs.

use alloy_primitives::{keccak256, Address, B256, U256};
use anyhow::{anyhow, bail, Result};

pub fn selector(sig: &str) -> [u8; 4] {
    let h = keccak256(sig.as_bytes());
    [h[0], h[1], h[2], h[3]]
}

pub fn topic(sig: &str) -> B256 {
    keccak256(sig.as_bytes())
}

pub fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    data.get(index * 32..index * 32 + 32).ok_or_else(|| anyhow!("abi data too short for word {index}"))
}

pub fn word_b256(data: &[u8], index: usize) -> Result<B256> {
    Ok(B256::from_slice(word(data, index)?))
}

pub fn word_u256(data: &[u8], index: usize) -> Result<U256> {
    Ok(U256::from_be_slice(word(data, index)?))
}

pub fn word_u64(data: &[u8], index: usize) -> Result<u64> {
    let v = word_u256(data, index)?;
    u64::try_from(v).map_err(|_| anyhow!("abi word {index} overflows u64"))
}

pub fn word_address(data: &[u8], index: usize) -> Result<Address> {
    Ok(Address::from_slice(&word(data, index)?[12..]))
}

/// Dynamic `bytes` whose offset is stored in word `index`. Offsets and lengths come from
/// the chain, so every bound is checked before slicing.
pub fn dynamic_bytes(data: &[u8], index: usize) -> Result<Vec<u8>> {
    let offset = usize::try_from(word_u64(data, index)?).map_err(|_| anyhow!("abi bytes offset out of range"))?;
    let start = offset.checked_add(32).ok_or_else(|| anyhow!("abi bytes offset {offset} out of range"))?;
    let len_word = data.get(offset..start).ok_or_else(|| anyhow!("abi bytes offset {offset} out of range"))?;
    let len = u64::try_from(U256::from_be_slice(len_word))
        .ok()
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| anyhow!("abi bytes too long"))?;
    let end = start.checked_add(len).ok_or_else(|| anyhow!("abi bytes length {len} out of range"))?;
    match data.get(start..end) {
        Some(b) => Ok(b.to_vec()),
        None => bail!("abi bytes payload truncated: want {len} at {start}, have {}", data.len()),
    }
}

/// Topic carrying an indexed uint256 that must fit a sequence number.
pub fn topic_u64(topics: &[B256], index: usize) -> Result<u64> {
    let t = topics.get(index).ok_or_else(|| anyhow!("missing topic {index}"))?;
    u64::try_from(U256::from_be_bytes(t.0)).map_err(|_| anyhow!("topic {index} overflows u64"))
}

/// Calldata encoder for static words followed by dynamic `bytes` tails.
#[derive(Default)]
pub struct CallEncoder {
    head: Vec<[u8; 32]>,
    tails: Vec<(usize, Vec<u8>)>,
}

impl CallEncoder {
    pub fn uint(mut self, v: u64) -> Self {
        self.head.push(U256::from(v).to_be_bytes::<32>());
        self
    }

    pub fn address(mut self, a: Address) -> Self {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(a.as_slice());
        self.head.push(w);
        self
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.tails.push((self.head.len(), b.to_vec()));
        self.head.push([0u8; 32]);
        self
    }

    pub fn encode(mut self, sig: &str) -> Vec<u8> {
        let mut tail = Vec::new();
        let head_len = self.head.len() * 32;
        for (slot, b) in &self.tails {
            self.head[*slot] = U256::from(head_len + tail.len()).to_be_bytes::<32>();
            tail.extend_from_slice(&U256::from(b.len()).to_be_bytes::<32>());
            tail.extend_from_slice(b);
            tail.resize(tail.len().div_ceil(32) * 32, 0);
        }
        let mut out = selector(sig).to_vec();
        for w in &self.head {
            out.extend_from_slice(w);
        }
        out.extend_from_slice(&tail);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_bytes_survive_encoding() {
        let payload = vec![7u8; 45];
        let data = CallEncoder::default().uint(9).bytes(&payload).address(Address::repeat_byte(3)).encode("f(uint256,bytes,address)");
        let args = &data[4..];
        assert_eq!(word_u64(args, 0).unwrap(), 9);
        assert_eq!(dynamic_bytes(args, 1).unwrap(), payload);
        assert_eq!(word_address(args, 2).unwrap(), Address::repeat_byte(3));
        assert_eq!(args.len() % 32, 0);
    }

    #[test]
    fn out_of_range_offsets_and_lengths_are_rejected() {
        let mut data = vec![0u8; 64];
        data[24..32].copy_from_slice(&(u64::MAX - 8).to_be_bytes());
        assert!(dynamic_bytes(&data, 0).is_err());

        // Offset fits, length word would run past the end of memory.
        let mut data = vec![0u8; 64];
        data[31] = 32;
        data[56..64].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(dynamic_bytes(&data, 0).is_err());

        data[56..64].copy_from_slice(&(u64::MAX - 16).to_be_bytes());
        assert!(dynamic_bytes(&data, 0).is_err());
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let data = CallEncoder::default().bytes(&[1, 2, 3]).encode("g(bytes)");
        assert!(dynamic_bytes(&data[4..data.len() - 32], 0).is_err());
    }
}
