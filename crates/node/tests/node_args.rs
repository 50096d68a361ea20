use std::time::Duration;

use alloy_primitives::Address;
use clap::Parser;
use rollup_inbox_reader::ReadMode;
use rollup_node::config::NodeArgs;

const CHAIN_INFO: &str = r#"[
    {
        "chain-id": 412346,
        "chain-name": "devnet",
        "rollup": {
            "bridge": "0x1111111111111111111111111111111111111111",
            "sequencer-inbox": "0x2222222222222222222222222222222222222222",
            "deployed-at": 77
        }
    }
]"#;

fn parse(extra: &[&str]) -> NodeArgs {
    NodeArgs::try_parse_from(std::iter::once("rollup-node").chain(extra.iter().copied())).unwrap()
}

#[test]
fn addresses_come_from_the_chain_info_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chains.json");
    std::fs::write(&path, CHAIN_INFO).unwrap();
    let path = path.to_str().unwrap();

    let args = parse(&["--chain.info-file", path, "--chain.name", "devnet"]);
    let addresses = args.rollup_addresses().unwrap();
    assert_eq!(addresses.bridge, Address::repeat_byte(0x11));
    assert_eq!(addresses.sequencer_inbox, Address::repeat_byte(0x22));
    assert_eq!(addresses.deployed_at, 77);

    let args = parse(&[
        "--chain.info-file",
        path,
        "--chain.name",
        "devnet",
        "--rollup.bridge",
        "0x3333333333333333333333333333333333333333",
        "--rollup.first-message-block",
        "5",
    ]);
    let addresses = args.rollup_addresses().unwrap();
    assert_eq!(addresses.bridge, Address::repeat_byte(0x33));
    assert_eq!(addresses.sequencer_inbox, Address::repeat_byte(0x22));
    assert_eq!(addresses.deployed_at, 5);

    assert!(parse(&["--chain.info-file", path, "--chain.name", "mainnet"]).rollup_addresses().is_err());
}

#[test]
fn missing_addresses_are_an_error() {
    assert!(parse(&[]).rollup_addresses().is_err());
    let args = parse(&["--rollup.bridge", "0x3333333333333333333333333333333333333333"]);
    assert!(args.rollup_addresses().is_err());
}

#[test]
fn component_configs_follow_flags() {
    let args = parse(&[
        "--rollup.bridge",
        "0x1111111111111111111111111111111111111111",
        "--rollup.sequencer-inbox",
        "0x2222222222222222222222222222222222222222",
        "--inbox-reader.read-mode",
        "finalized",
        "--inbox-reader.hard-reorg",
        "--seq-coordinator.my-url",
        "http://seq-0:8547",
        "--seq-coordinator.lockout-duration-ms",
        "2000",
        "--seq-coordinator.lockout-spare-ms",
        "500",
    ]);
    let reader = args.inbox_reader_config();
    assert_eq!(reader.read_mode, ReadMode::Finalized);
    assert!(reader.hard_reorg);

    let coordinator = args.coordinator_config();
    assert_eq!(coordinator.my_url, "http://seq-0:8547");
    assert_eq!(coordinator.lockout_duration, Duration::from_secs(2));
    assert!(!coordinator.enable);
    assert!(args.validate().is_ok());

    let poster = args.poster_config(&args.rollup_addresses().unwrap());
    assert_eq!(poster.sequencer_inbox, Address::repeat_byte(0x22));
}

#[test]
fn poster_needs_a_sender() {
    let args = parse(&[
        "--rollup.bridge",
        "0x1111111111111111111111111111111111111111",
        "--rollup.sequencer-inbox",
        "0x2222222222222222222222222222222222222222",
        "--poster.enable",
    ]);
    assert!(args.validate().is_err());
}
