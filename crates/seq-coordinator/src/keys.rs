pub const CHOSEN_KEY: &str = "coordinator.chosen";
pub const MSG_COUNT_KEY: &str = "coordinator.msgCount";
/// Comma separated urls, most preferred first. Maintained by operators.
pub const PRIORITIES_KEY: &str = "coordinator.priorities";
pub const LIVELINESS_KEY_PREFIX: &str = "coordinator.liveliness.";
pub const MESSAGE_KEY_PREFIX: &str = "coordinator.msg.";

pub const LIVELINESS_VAL: &[u8] = b"OK";

pub fn liveliness_key_for(url: &str) -> String {
    format!("{LIVELINESS_KEY_PREFIX}{url}")
}

pub fn message_key_for(pos: u64) -> String {
    format!("{MESSAGE_KEY_PREFIX}{pos:016x}")
}

pub fn encode_msg_count(count: u64) -> Vec<u8> {
    count.to_be_bytes().to_vec()
}

pub fn decode_msg_count(raw: &[u8]) -> anyhow::Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| anyhow::anyhow!("message count value has {} bytes, expected 8", raw.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn parse_priorities(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
