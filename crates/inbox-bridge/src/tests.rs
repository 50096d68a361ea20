use crate::abi::{selector, topic};
use crate::selectors::{
    EVT_SEQUENCER_BATCH_DATA, EVT_SEQUENCER_BATCH_DELIVERED, SIG_BATCH_COUNT, SIG_DELAYED_COUNT,
    SIG_DELAYED_INBOX_ACCS, SIG_INBOX_ACCS,
};

fn selector_hex(sig: &str) -> String {
    hex::encode(selector(sig))
}

#[test]
fn test_function_selectors_match_expected() {
    assert_eq!(selector_hex(SIG_BATCH_COUNT), "06f13056");
    assert_eq!(selector_hex(SIG_INBOX_ACCS), "d9dd67ab");
    assert_eq!(selector_hex(SIG_DELAYED_COUNT), "eca067ad");
    assert_eq!(selector_hex(SIG_DELAYED_INBOX_ACCS), "d5719dc2");
}

#[test]
fn test_sequencer_event_topics_are_stable() {
    assert_eq!(
        format!("{:#x}", topic(EVT_SEQUENCER_BATCH_DELIVERED)),
        "0x7394f4a19a13c7b92b5bb71033245305946ef78452f7b4986ac1390b5df4ebd7"
    );
    assert_eq!(
        format!("{:#x}", topic(EVT_SEQUENCER_BATCH_DATA)),
        "0xff64905f73a67fb594e0f940a8075a860db489ad991e032f48c81123eb52d60b"
    );
}
