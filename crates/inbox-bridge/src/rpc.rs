use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{Address, B256};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
    Safe,
    Finalized,
}

impl BlockTag {
    fn as_param(&self) -> String {
        match self {
            BlockTag::Number(n) => format!("0x{n:x}"),
            BlockTag::Latest => "latest".into(),
            BlockTag::Safe => "safe".into(),
            BlockTag::Finalized => "finalized".into(),
        }
    }
}

/// Log entry as returned by `eth_getLogs`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub data: alloy_primitives::Bytes,
    pub topics: Vec<B256>,
    #[serde(default, with = "opt_quantity")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
}

#[derive(Deserialize)]
struct RpcBlockHeader {
    #[serde(with = "opt_quantity")]
    number: Option<u64>,
}

#[derive(Deserialize)]
struct RpcTransaction {
    input: alloy_primitives::Bytes,
}

mod opt_quantity {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcReq<'a, T> {
    jsonrpc: &'a str,
    id: u64,
    method: &'a str,
    params: T,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct RpcResp<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        Self { url, http: reqwest::Client::new(), next_id: AtomicU64::new(1) }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call<T: for<'de> serde::Deserialize<'de>, P: serde::Serialize>(&self, method: &str, params: P) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = RpcReq { jsonrpc: "2.0", id, method, params };
        let resp = self.http.post(&self.url).json(&req).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("rpc http error {}: {}", status, text);
        }
        let parsed: RpcResp<T> = serde_json::from_str(&text)?;
        if let Some(err) = parsed.error {
            anyhow::bail!("rpc error {}: {}", err.code, err.message);
        }
        parsed.result.ok_or_else(|| anyhow::anyhow!("missing result for {method}"))
    }

    pub async fn eth_call(&self, to: Address, data: &[u8], block: BlockTag) -> Result<Vec<u8>> {
        let res: alloy_primitives::Bytes = self
            .call(
                "eth_call",
                json!([{ "to": format!("{to:#x}"), "data": format!("0x{}", hex::encode(data)) }, block.as_param()]),
            )
            .await?;
        Ok(res.to_vec())
    }

    /// Logs of `address` in `[from, to]` whose topics match `topics` position by position.
    pub async fn get_logs(&self, address: &[Address], from: u64, to: u64, topics: Vec<Vec<B256>>) -> Result<Vec<RpcLog>> {
        let topics: Vec<Vec<String>> =
            topics.iter().map(|alts| alts.iter().map(|t| format!("{t:#x}")).collect()).collect();
        let addresses: Vec<String> = address.iter().map(|a| format!("{a:#x}")).collect();
        let filter = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "address": addresses,
            "topics": topics,
        });
        self.call("eth_getLogs", json!([filter])).await
    }

    pub async fn block_number(&self, tag: BlockTag) -> Result<u64> {
        let header: Option<RpcBlockHeader> = self.call("eth_getBlockByNumber", json!([tag.as_param(), false])).await?;
        header
            .and_then(|h| h.number)
            .ok_or_else(|| anyhow::anyhow!("no block for tag {}", tag.as_param()))
    }

    pub async fn transaction_input(&self, tx_hash: B256) -> Result<Vec<u8>> {
        let tx: Option<RpcTransaction> = self.call("eth_getTransactionByHash", json!([format!("{tx_hash:#x}")])).await?;
        tx.map(|t| t.input.to_vec()).ok_or_else(|| anyhow::anyhow!("transaction {tx_hash} not found"))
    }

    /// Sends a transaction from an account the endpoint manages and returns its hash.
    pub async fn send_transaction(&self, from: Address, to: Address, data: &[u8]) -> Result<B256> {
        self.call(
            "eth_sendTransaction",
            json!([{
                "from": format!("{from:#x}"),
                "to": format!("{to:#x}"),
                "data": format!("0x{}", hex::encode(data)),
            }]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_decodes_from_json() {
        let raw = json!({
            "address": "0x1000000000000000000000000000000000000001",
            "data": "0x0102",
            "topics": ["0x00000000000000000000000000000000000000000000000000000000000000ff"],
            "blockNumber": "0x1b",
            "blockHash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
        });
        let log: RpcLog = serde_json::from_value(raw).unwrap();
        assert_eq!(log.block_number, Some(27));
        assert_eq!(log.data.as_ref(), &[1, 2]);
        assert_eq!(log.topics[0], B256::with_last_byte(0xff));
        assert!(log.transaction_hash.is_none());
    }

    #[test]
    fn block_tags_render_as_rpc_params() {
        assert_eq!(BlockTag::Number(255).as_param(), "0xff");
        assert_eq!(BlockTag::Safe.as_param(), "safe");
    }
}
