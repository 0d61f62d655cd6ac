// Chain event fan-out.
//
// The blockchain backend hands the relay typed events; each expands into
// the conventional channel set with a broadcast priority. Confirmed
// transactions are urgent (priority 1), blocks are near-urgent (2),
// everything else rides the regular batch (3).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::broadcast::Broadcaster;

pub const BLOCKS_CHANNEL: &str = "chain.blocks";
pub const TRANSACTIONS_CHANNEL: &str = "chain.transactions";
pub const PENDING_TRANSACTIONS_CHANNEL: &str = "chain.transactions.pending";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainEvent {
    Block {
        number: u64,
        hash: String,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        transaction_count: u64,
    },
    Transaction {
        hash: String,
        block_number: u64,
        block_hash: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        value: f64,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    PendingTransaction {
        hash: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        value: f64,
    },
}

/// One broadcast produced by expanding a chain event.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOut {
    pub channel: String,
    pub priority: u8,
    pub payload: Value,
}

/// Expand a chain event into its channel broadcasts: the firehose channel
/// for the event kind, plus per-address channels for each side of a
/// transaction.
pub fn fan_out(event: &ChainEvent) -> Vec<FanOut> {
    match event {
        ChainEvent::Block { number, hash, timestamp, transaction_count } => vec![FanOut {
            channel: BLOCKS_CHANNEL.to_string(),
            priority: 2,
            payload: json!({
                "event": "new_block",
                "block_number": number,
                "block_hash": hash,
                "timestamp": timestamp,
                "transactions_count": transaction_count,
            }),
        }],
        ChainEvent::Transaction { hash, block_number, block_hash, from, to, value, timestamp } => {
            let mut broadcasts = vec![FanOut {
                channel: TRANSACTIONS_CHANNEL.to_string(),
                priority: 1,
                payload: json!({
                    "event": "new_transaction",
                    "tx_hash": hash,
                    "block_number": block_number,
                    "block_hash": block_hash,
                    "from": from,
                    "to": to,
                    "value": value,
                    "timestamp": timestamp,
                    "status": "confirmed",
                }),
            }];
            if let Some(from) = from {
                broadcasts.push(FanOut {
                    channel: format!("chain.address.{from}"),
                    priority: 3,
                    payload: json!({
                        "event": "outgoing_transaction",
                        "tx_hash": hash,
                        "to": to,
                        "value": value,
                        "block_number": block_number,
                        "timestamp": timestamp,
                    }),
                });
            }
            if let Some(to) = to {
                broadcasts.push(FanOut {
                    channel: format!("chain.address.{to}"),
                    priority: 3,
                    payload: json!({
                        "event": "incoming_transaction",
                        "tx_hash": hash,
                        "from": from,
                        "value": value,
                        "block_number": block_number,
                        "timestamp": timestamp,
                    }),
                });
            }
            broadcasts
        }
        ChainEvent::PendingTransaction { hash, from, to, value } => {
            let mut broadcasts = vec![FanOut {
                channel: PENDING_TRANSACTIONS_CHANNEL.to_string(),
                priority: 3,
                payload: json!({
                    "event": "new_pending_transaction",
                    "tx_hash": hash,
                    "from": from,
                    "to": to,
                    "value": value,
                }),
            }];
            if let Some(from) = from {
                broadcasts.push(FanOut {
                    channel: format!("chain.address.{from}.pending"),
                    priority: 3,
                    payload: json!({
                        "event": "new_outgoing_transaction",
                        "tx_hash": hash,
                        "to": to,
                        "value": value,
                    }),
                });
            }
            if let Some(to) = to {
                broadcasts.push(FanOut {
                    channel: format!("chain.address.{to}.pending"),
                    priority: 3,
                    payload: json!({
                        "event": "new_incoming_transaction",
                        "tx_hash": hash,
                        "from": from,
                        "value": value,
                    }),
                });
            }
            broadcasts
        }
    }
}

/// Queue every broadcast a chain event expands into. Returns the assigned
/// message ids.
pub async fn publish(broadcaster: &Broadcaster, event: &ChainEvent) -> Vec<String> {
    let mut message_ids = Vec::new();
    for broadcast in fan_out(event) {
        if let Some(message_id) = broadcaster
            .queue_message(&broadcast.channel, broadcast.payload, broadcast.priority, None, false)
            .await
        {
            message_ids.push(message_id);
        }
    }
    message_ids
}

#[cfg(test)]
mod tests {
    use super::{fan_out, ChainEvent, BLOCKS_CHANNEL, TRANSACTIONS_CHANNEL};

    #[test]
    fn block_fans_out_to_the_blocks_channel() {
        let event = ChainEvent::Block {
            number: 42,
            hash: "abc".into(),
            timestamp: Some(1_700_000_000),
            transaction_count: 3,
        };
        let broadcasts = fan_out(&event);
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].channel, BLOCKS_CHANNEL);
        assert_eq!(broadcasts[0].priority, 2);
        assert_eq!(broadcasts[0].payload["event"], "new_block");
        assert_eq!(broadcasts[0].payload["block_number"], 42);
    }

    #[test]
    fn confirmed_transaction_is_urgent_and_covers_both_addresses() {
        let event = ChainEvent::Transaction {
            hash: "tx1".into(),
            block_number: 42,
            block_hash: "abc".into(),
            from: Some("EQfrom".into()),
            to: Some("EQto".into()),
            value: 1.5,
            timestamp: None,
        };
        let broadcasts = fan_out(&event);
        assert_eq!(broadcasts.len(), 3);
        assert_eq!(broadcasts[0].channel, TRANSACTIONS_CHANNEL);
        assert_eq!(broadcasts[0].priority, 1);
        assert_eq!(broadcasts[0].payload["status"], "confirmed");
        assert_eq!(broadcasts[1].channel, "chain.address.EQfrom");
        assert_eq!(broadcasts[1].payload["event"], "outgoing_transaction");
        assert_eq!(broadcasts[2].channel, "chain.address.EQto");
        assert_eq!(broadcasts[2].payload["event"], "incoming_transaction");
    }

    #[test]
    fn pending_transaction_without_addresses_fans_out_once() {
        let event =
            ChainEvent::PendingTransaction { hash: "tx2".into(), from: None, to: None, value: 0.1 };
        let broadcasts = fan_out(&event);
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].channel, "chain.transactions.pending");
        assert_eq!(broadcasts[0].priority, 3);
    }

    #[test]
    fn chain_events_deserialize_from_tagged_json() {
        let event: ChainEvent = serde_json::from_value(serde_json::json!({
            "kind": "block",
            "number": 7,
            "hash": "h",
        }))
        .expect("block event should parse");
        assert!(matches!(event, ChainEvent::Block { number: 7, .. }));
    }
}
