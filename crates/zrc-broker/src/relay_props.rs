use proptest::prelude::*;

use crate::relay::{InMemorySignalRelay, RelayConfig, SignalRelay};
use crate::types::{SignalRole, SignalType};

fn role_strategy() -> impl Strategy<Value = SignalRole> {
    prop_oneof![Just(SignalRole::Operator), Just(SignalRole::Agent)]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    // A poll never hands a party its own messages, whatever the interleaving.
    #[test]
    fn test_echo_suppression(
        senders in prop::collection::vec(role_strategy(), 0..60),
        poller in role_strategy(),
    ) {
        let relay = InMemorySignalRelay::default();
        let delivered = runtime().block_on(async {
            for (i, sender) in senders.iter().enumerate() {
                relay
                    .post("s", SignalType::IceCandidate, serde_json::json!(i), *sender)
                    .await
                    .unwrap();
            }
            relay.poll("s", 0, poller).await.unwrap()
        });

        prop_assert!(delivered.iter().all(|m| m.sender != poller));
        let expected = senders.iter().filter(|s| **s != poller).count();
        prop_assert_eq!(delivered.len(), expected);
    }

    // The queue keeps exactly the most recent `limit` messages, in order.
    #[test]
    fn test_cap_keeps_most_recent(
        limit in 1..20usize,
        total in 1..60usize,
    ) {
        let relay = InMemorySignalRelay::new(RelayConfig {
            max_queue_length: limit,
            ..RelayConfig::default()
        });
        let delivered = runtime().block_on(async {
            for i in 0..total {
                relay
                    .post("s", SignalType::IceCandidate, serde_json::json!(i), SignalRole::Agent)
                    .await
                    .unwrap();
            }
            relay.poll("s", 0, SignalRole::Operator).await.unwrap()
        });

        let kept = total.min(limit);
        prop_assert_eq!(delivered.len(), kept);
        let values: Vec<usize> = delivered
            .iter()
            .map(|m| m.data.as_u64().unwrap() as usize)
            .collect();
        let expected: Vec<usize> = (total - kept..total).collect();
        prop_assert_eq!(values, expected);
    }

    // Polling from the last seen timestamp never skips or repeats a message.
    #[test]
    fn test_cursor_sees_every_message_once(
        batches in prop::collection::vec(1..8usize, 1..8),
    ) {
        let relay = InMemorySignalRelay::default();
        let seen = runtime().block_on(async {
            let mut since = 0;
            let mut seen = Vec::new();
            let mut next = 0usize;
            for batch in &batches {
                for _ in 0..*batch {
                    relay
                        .post("s", SignalType::IceCandidate, serde_json::json!(next), SignalRole::Operator)
                        .await
                        .unwrap();
                    next += 1;
                }
                for msg in relay.poll("s", since, SignalRole::Agent).await.unwrap() {
                    since = since.max(msg.timestamp);
                    seen.push(msg.data.as_u64().unwrap() as usize);
                }
            }
            seen
        });

        let total: usize = batches.iter().sum();
        prop_assert_eq!(seen, (0..total).collect::<Vec<_>>());
    }
}
