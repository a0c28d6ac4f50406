//! Unit tests for ledger replay spliced with live delivery.

use std::sync::Arc;

use chrono::Utc;
use happyd::bus::{BusEvent, Delivery, DropPolicy, EventBus, SubscriptionFilter};
use happyd::config::LedgerConfig;
use happyd::events::{AgentEvent, SessionEvent};
use happyd::ledger::MessageLedger;

fn bus() -> Arc<EventBus> {
    let ledger = Arc::new(MessageLedger::new(LedgerConfig {
        persist_shards: false,
        ..LedgerConfig::default()
    }));
    EventBus::new(ledger, 256)
}

fn text_event(session: &str, seq: u64) -> SessionEvent {
    let event = AgentEvent::AssistantText { content: format!("m{seq}"), is_final: false };
    SessionEvent {
        session_id: session.into(),
        seq,
        at: Utc::now(),
        fingerprint: happyd::events::fingerprint(seq, &event),
        event,
    }
}

fn drain_seqs(sub: &happyd::bus::Subscription) -> Vec<u64> {
    let mut seqs = vec![];
    while let Some(delivery) = sub.try_recv() {
        match delivery {
            Delivery::Event(BusEvent::Session(ev)) => seqs.push(ev.seq),
            Delivery::Gap { .. } | Delivery::Event(_) => {}
        }
    }
    seqs
}

#[tokio::test]
async fn replay_then_live_is_contiguous() {
    let bus = bus();

    for seq in 1..=5 {
        bus.publish_session(text_event("s1", seq));
    }

    // Late subscriber: replay from 2, then live events resume.
    let sub = bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);
    bus.replay(&sub, "s1", 2);

    for seq in 6..=8 {
        bus.publish_session(text_event("s1", seq));
    }

    let seqs = drain_seqs(&sub);
    assert_eq!(seqs, vec![2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn replay_discards_queued_duplicates() {
    let bus = bus();
    let sub = bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);

    // Events already queued live AND stored in the ledger.
    for seq in 1..=4 {
        bus.publish_session(text_event("s1", seq));
    }

    // Replay from the start: the queued copies are replaced, not doubled.
    bus.replay(&sub, "s1", 1);
    for seq in 5..=6 {
        bus.publish_session(text_event("s1", seq));
    }

    let seqs = drain_seqs(&sub);
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn replay_interleaved_with_appends_never_tears() {
    let bus = bus();

    for seq in 1..=3 {
        bus.publish_session(text_event("s1", seq));
    }

    let sub = bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);

    // Appends racing the replay from another task.
    let writer_bus = Arc::clone(&bus);
    let writer = tokio::spawn(async move {
        for seq in 4..=40 {
            writer_bus.publish_session(text_event("s1", seq));
            if seq % 8 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    bus.replay(&sub, "s1", 1);
    writer.await.expect("writer task");

    let seqs = drain_seqs(&sub);
    assert_eq!(seqs.first(), Some(&1));
    assert_eq!(seqs.last(), Some(&40));
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "gap or duplicate at {pair:?}");
    }
}

#[tokio::test]
async fn replay_only_touches_the_named_session() {
    let bus = bus();
    let sub = bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);

    bus.publish_session(text_event("other", 1));
    bus.publish_session(text_event("s1", 1));
    bus.replay(&sub, "s1", 1);

    let mut sessions = vec![];
    while let Some(delivery) = sub.try_recv() {
        if let Delivery::Event(BusEvent::Session(ev)) = delivery {
            sessions.push((ev.session_id.clone(), ev.seq));
        }
    }
    assert!(sessions.contains(&("other".into(), 1)));
    assert!(sessions.contains(&("s1".into(), 1)));
    assert_eq!(sessions.len(), 2);
}
