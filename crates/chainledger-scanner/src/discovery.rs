//! Factory discovery — turns deployment events into contract instance addresses.

use chainledger_core::config::DiscoveryConfig;
use chainledger_core::types::{normalize_address, RawEvent};

/// Extract the deployed instance address from a factory deployment event.
///
/// The address sits in the low 20 bytes of the configured indexed topic.
pub fn instance_address(event: &RawEvent, config: &DiscoveryConfig) -> Option<String> {
    let topic = event.payload["topics"]
        .as_array()?
        .get(config.address_topic)?
        .as_str()?;
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() < 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(normalize_address(&hex[hex.len() - 40..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(topics: serde_json::Value) -> RawEvent {
        RawEvent {
            contract_address: "0xfac7".into(),
            chain_id: 1,
            block_number: 100,
            tx_hash: "0x01".into(),
            log_index: 0,
            event_type: "0xdeploy".into(),
            payload: json!({ "topics": topics, "data": "0x" }),
        }
    }

    #[test]
    fn extracts_low_twenty_bytes() {
        let cfg = DiscoveryConfig::default();
        let ev = deployment(json!([
            "0xdeploy",
            "0x000000000000000000000000AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
        ]));
        assert_eq!(
            instance_address(&ev, &cfg).as_deref(),
            Some("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        );
    }

    #[test]
    fn missing_or_short_topic_is_ignored() {
        let cfg = DiscoveryConfig::default();
        assert!(instance_address(&deployment(json!(["0xdeploy"])), &cfg).is_none());
        assert!(instance_address(&deployment(json!(["0xdeploy", "0x1234"])), &cfg).is_none());
    }
}
