use std::path::Path;

use alloy_primitives::Address;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Chains(pub Vec<ChainInfo>);

#[derive(Debug, Deserialize)]
pub struct ChainInfo {
    #[serde(rename = "chain-id")]
    pub chain_id: Option<u64>,
    #[serde(rename = "chain-name")]
    pub chain_name: Option<String>,
    #[serde(rename = "rollup")]
    pub rollup: Option<RollupAddresses>,
}

/// Parent chain contracts of one rollup.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RollupAddresses {
    pub bridge: Address,
    #[serde(rename = "sequencer-inbox")]
    pub sequencer_inbox: Address,
    /// Parent chain block the contracts were deployed at; reading starts there.
    #[serde(rename = "deployed-at", default)]
    pub deployed_at: u64,
}

pub fn parse(json: &str) -> anyhow::Result<Chains> {
    let chains: Vec<ChainInfo> = serde_json::from_str(json)?;
    Ok(Chains(chains))
}

pub fn load(path: &Path) -> anyhow::Result<Chains> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading chain info {}: {e}", path.display()))?;
    parse(&json)
}

impl Chains {
    pub fn select_by_chain_id(&self, chain_id: u64) -> Option<&ChainInfo> {
        self.0.iter().find(|c| c.chain_id == Some(chain_id))
    }

    pub fn select_by_name(&self, name: &str) -> Option<&ChainInfo> {
        self.0.iter().find(|c| c.chain_name.as_deref() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "chain-id": 412346,
            "chain-name": "devnet",
            "rollup": {
                "bridge": "0x38f918D0E7b4E9b3814dFf41b1e1B3A0D89333a9",
                "sequencer-inbox": "0x6c97864C01d5903BC8C9C3688B1560a42F1ebE0D",
                "deployed-at": 4139226
            }
        },
        { "chain-id": 1, "chain-name": "bare" }
    ]"#;

    #[test]
    fn selects_rollup_addresses() {
        let chains = parse(SAMPLE).unwrap();
        let devnet = chains.select_by_name("devnet").unwrap();
        let rollup = devnet.rollup.as_ref().unwrap();
        assert_eq!(rollup.deployed_at, 4139226);
        assert_eq!(rollup.bridge, "0x38f918D0E7b4E9b3814dFf41b1e1B3A0D89333a9".parse::<Address>().unwrap());
        assert!(chains.select_by_chain_id(1).unwrap().rollup.is_none());
        assert!(chains.select_by_chain_id(5).is_none());
    }
}
