//! Inbox, work queue, DLQ, and channel behavior against the in-process
//! substrate.

use std::sync::Arc;
use std::time::Duration;

use loom_adapters::MemorySubstrate;
use loom_domain::{
    capability_stream_name, inbox_subject, ChannelDescriptor, LoomError, Scope, WorkFilter,
    WorkOffer, DLQ_STREAM,
};
use loom_engine::{
    ClaimOutcome, CoordinationEngine, EngineConfig, ReadFilter, RegisterParams, WorkQueue,
};
use loom_ports::{FetchedMessage, Substrate};

const PROJECT: &str = "0123456789abcdef";

fn engine_with(channels: Vec<ChannelDescriptor>) -> (Arc<MemorySubstrate>, CoordinationEngine<MemorySubstrate>) {
    let substrate = Arc::new(MemorySubstrate::new());
    let mut config = EngineConfig::for_project(PROJECT, "/proj");
    config.channels = channels;
    config.inbox_fetch_timeout = Duration::from_millis(100);
    let engine = CoordinationEngine::new(substrate.clone(), config);
    (substrate, engine)
}

async fn register(
    engine: &CoordinationEngine<MemorySubstrate>,
    handle: &str,
    capabilities: &[&str],
) -> loom_domain::RegistryEntry {
    engine
        .registry
        .register(RegisterParams {
            agent_type: "worker".to_string(),
            handle: handle.to_string(),
            hostname: "host-a".to_string(),
            project_id: PROJECT.to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            username: None,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            scope: Scope::Team,
            stable_agent_id: None,
        })
        .await
        .expect("register")
}

fn offer(capability: &str, task_id: &str, priority: u8) -> WorkOffer {
    WorkOffer {
        task_id: task_id.to_string(),
        description: format!("do {task_id}"),
        capability: capability.to_string(),
        priority,
        deadline: None,
        context_data: None,
        scope: Scope::Team,
    }
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_direct_requires_registration_and_recipient() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let recipient = register(&engine, "rx", &[]).await;

    let err = engine
        .inbox
        .send_direct(
            "6c84fb90-12c4-4a1c-8e2b-2d0a3c7b9f10",
            &recipient.guid,
            "text",
            "hi",
            None,
        )
        .await
        .expect_err("unregistered sender");
    assert!(matches!(err, LoomError::Validation { .. }));

    let sender = register(&engine, "tx", &[]).await;
    let err = engine
        .inbox
        .send_direct(
            &sender.guid,
            "2f1e4d3c-5b6a-4798-8c9d-0e1f2a3b4c5d",
            "text",
            "hi",
            None,
        )
        .await
        .expect_err("unknown recipient");
    assert!(matches!(err, LoomError::NotFound { .. }));

    let err = engine
        .inbox
        .send_direct(&sender.guid, "not-a-guid", "text", "hi", None)
        .await
        .expect_err("bad recipient guid");
    assert!(matches!(err, LoomError::Validation { .. }));

    let receipt = engine
        .inbox
        .send_direct(&sender.guid, &recipient.guid, "text", "hi", None)
        .await
        .expect("send");
    assert_eq!(receipt.recipient_status, loom_domain::AgentStatus::Online);
}

#[tokio::test]
async fn read_direct_is_consume_once_and_sorted() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let recipient = register(&engine, "rx", &[]).await;

    for i in 0..3 {
        engine
            .inbox
            .send_direct(&sender.guid, &recipient.guid, "text", &format!("m{i}"), None)
            .await
            .expect("send");
    }

    let page = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 2)
        .await
        .expect("read");
    assert_eq!(page.messages.len(), 2);
    assert!(page.has_more, "a third message remains");
    assert!(
        page.messages[0].timestamp <= page.messages[1].timestamp,
        "ascending timestamps"
    );
    assert_eq!(page.messages[0].content, "m0");

    let page2 = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 10)
        .await
        .expect("read rest");
    assert_eq!(page2.messages.len(), 1, "consumed messages never reappear");
    assert_eq!(page2.messages[0].content, "m2");
    assert!(!page2.has_more);

    let page3 = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 10)
        .await
        .expect("read empty");
    assert!(page3.messages.is_empty());
    assert!(!page3.has_more);
}

#[tokio::test]
async fn read_direct_filters_consume_nonmatching() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let alice = register(&engine, "alice", &[]).await;
    let bob = register(&engine, "bob", &[]).await;
    let recipient = register(&engine, "rx", &[]).await;

    engine
        .inbox
        .send_direct(&alice.guid, &recipient.guid, "text", "from alice", None)
        .await
        .expect("send");
    engine
        .inbox
        .send_direct(&bob.guid, &recipient.guid, "status", "from bob", None)
        .await
        .expect("send");

    let filter = ReadFilter {
        sender_guid: Some(bob.guid.clone()),
        message_type: Some("status".to_string()),
    };
    let page = engine
        .inbox
        .read_direct(&recipient.guid, &filter, 10)
        .await
        .expect("read");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "from bob");

    // The filtered-out message was disposed of too.
    let page = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 10)
        .await
        .expect("read again");
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn read_direct_survives_poison_messages() {
    let (substrate, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let recipient = register(&engine, "rx", &[]).await;

    engine
        .inbox
        .send_direct(&sender.guid, &recipient.guid, "text", "good", None)
        .await
        .expect("send");
    substrate
        .publish(&inbox_subject(&recipient.guid), b"{not json".to_vec())
        .await
        .expect("inject poison");

    let page = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 10)
        .await
        .expect("read");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "good");

    // The poison message was acknowledged, not redelivered.
    let page = engine
        .inbox
        .read_direct(&recipient.guid, &ReadFilter::default(), 10)
        .await
        .expect("read again");
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn inbox_subscription_notifies_in_real_time() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let session = engine.session(None);
    session
        .register(loom_engine::RegisterRequest {
            agent_type: "worker".to_string(),
            handle: "rx".to_string(),
            capabilities: vec![],
            scope: Scope::Team,
        })
        .await
        .expect("register");
    let guid = session.guid().await.expect("guid");
    let mut notifications = session.subscribe_inbox().await.expect("subscribe");

    let sender = register(&engine, "tx", &[]).await;
    engine
        .inbox
        .send_direct(&sender.guid, &guid, "text", "ping", None)
        .await
        .expect("send");

    let note = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .expect("notification in time")
        .expect("channel open");
    assert_eq!(note.content, "ping");

    // The notification did not consume the durable copy.
    let page = engine
        .inbox
        .read_direct(&guid, &ReadFilter::default(), 10)
        .await
        .expect("read");
    assert_eq!(page.messages.len(), 1);

    // A second subscription supersedes the first; deregister stops it.
    let _second = session.subscribe_inbox().await.expect("resubscribe");
    session.deregister().await.expect("deregister");
    let closed = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .expect("superseded channel closes");
    assert!(closed.is_none());
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_then_claim_then_empty() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let claimer = register(&engine, "worker-1", &["typescript"]).await;

    let offered = engine
        .work_queue
        .broadcast(&sender.guid, offer("typescript", "t", 8))
        .await
        .expect("broadcast");

    let stats = engine
        .work_queue
        .status(Some("typescript"))
        .await
        .expect("status");
    assert_eq!(stats[0].stream, "WORKQUEUE_TYPESCRIPT");
    assert_eq!(stats[0].stats.messages, 1);

    let outcome = engine
        .work_queue
        .claim(&claimer.guid, "typescript", Some(Duration::from_millis(500)))
        .await
        .expect("claim");
    let claimed = match outcome {
        ClaimOutcome::Claimed(item) => item,
        ClaimOutcome::Empty => panic!("expected a claim"),
    };
    assert_eq!(claimed.id, offered.id);
    assert_eq!(claimed.priority, 8);
    assert_eq!(claimed.attempts, 1, "attempts reflect the delivery");

    let outcome = engine
        .work_queue
        .claim(&claimer.guid, "typescript", Some(Duration::from_millis(150)))
        .await
        .expect("second claim");
    assert!(matches!(outcome, ClaimOutcome::Empty), "the item is gone");
}

#[tokio::test]
async fn claim_validates_registration_and_capability() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let err = engine
        .work_queue
        .claim(
            "6c84fb90-12c4-4a1c-8e2b-2d0a3c7b9f10",
            "rust",
            Some(Duration::from_millis(100)),
        )
        .await
        .expect_err("unregistered claimer");
    assert!(matches!(err, LoomError::Validation { .. }));

    let claimer = register(&engine, "worker-1", &["go"]).await;
    let err = engine
        .work_queue
        .claim(&claimer.guid, "rust", Some(Duration::from_millis(100)))
        .await
        .expect_err("missing capability");
    assert!(matches!(err, LoomError::Validation { .. }));
}

#[tokio::test]
async fn concurrent_claims_never_duplicate() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let a = register(&engine, "worker-a", &["rust"]).await;
    let b = register(&engine, "worker-b", &["rust"]).await;

    for i in 0..4 {
        engine
            .work_queue
            .broadcast(&sender.guid, offer("rust", &format!("t{i}"), 5))
            .await
            .expect("broadcast");
    }

    let qa = WorkQueue::clone(&engine.work_queue);
    let qb = WorkQueue::clone(&engine.work_queue);
    let guid_a = a.guid.clone();
    let guid_b = b.guid.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { qa.claim(&guid_a, "rust", Some(Duration::from_millis(500))).await }),
        tokio::spawn(async move { qb.claim(&guid_b, "rust", Some(Duration::from_millis(500))).await }),
    );

    let mut ids = Vec::new();
    for result in [ra.expect("join"), rb.expect("join")] {
        if let ClaimOutcome::Claimed(item) = result.expect("claim") {
            ids.push(item.id);
        }
    }
    assert_eq!(ids.len(), 2);
    ids.dedup();
    assert_eq!(ids.len(), 2, "no item claimed twice");
}

#[tokio::test]
async fn list_is_non_destructive_and_filters() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let claimer = register(&engine, "worker-1", &["rust"]).await;

    for (task, priority) in [("low", 2), ("mid", 5), ("high", 9)] {
        engine
            .work_queue
            .broadcast(&sender.guid, offer("rust", task, priority))
            .await
            .expect("broadcast");
    }

    let listing = engine
        .work_queue
        .list(
            "rust",
            &WorkFilter {
                min_priority: Some(5),
                ..Default::default()
            },
            10,
        )
        .await
        .expect("list");
    assert_eq!(listing.total, 2);
    assert!(!listing.truncated);

    // Listing consumed nothing.
    let outcome = engine
        .work_queue
        .claim(&claimer.guid, "rust", Some(Duration::from_millis(500)))
        .await
        .expect("claim");
    assert!(matches!(outcome, ClaimOutcome::Claimed(_)));

    // Unknown capability lists empty, not an error.
    let listing = engine
        .work_queue
        .list("nonexistent", &WorkFilter::default(), 10)
        .await
        .expect("list");
    assert_eq!(listing.total, 0);
}

#[tokio::test]
async fn queue_status_enumerates_nonempty_queues() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    engine
        .work_queue
        .broadcast(&sender.guid, offer("rust", "a", 5))
        .await
        .expect("broadcast");
    for i in 0..2 {
        engine
            .work_queue
            .broadcast(&sender.guid, offer("go", &format!("b{i}"), 5))
            .await
            .expect("broadcast");
    }

    let statuses = engine.work_queue.status(None).await.expect("status");
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].stream, "WORKQUEUE_GO", "largest backlog first");
    assert_eq!(statuses[1].stream, "WORKQUEUE_RUST");
    assert!(
        statuses.iter().all(|s| s.stream != DLQ_STREAM),
        "the DLQ is not a work queue"
    );

    let err = engine
        .work_queue
        .status(Some("nonexistent"))
        .await
        .expect_err("unknown queue");
    assert!(matches!(err, LoomError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_items_move_to_the_dlq() {
    let (substrate, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let claimer = register(&engine, "worker-1", &["rust"]).await;

    let offered = engine
        .work_queue
        .broadcast(&sender.guid, offer("rust", "doomed", 5))
        .await
        .expect("broadcast");

    // Simulate three crashed claimants: fetch and negatively acknowledge
    // until the work-item budget (3) is spent.
    let stream = capability_stream_name("rust");
    for _ in 0..3 {
        let batch = substrate
            .fetch(&stream, "workers", 1, Duration::from_millis(200))
            .await
            .expect("fetch");
        batch[0].nak().await.expect("nak");
    }

    // The next claim observes the exhausted budget, dead-letters the item,
    // and comes up empty.
    let outcome = engine
        .work_queue
        .claim(&claimer.guid, "rust", Some(Duration::from_millis(300)))
        .await
        .expect("claim");
    assert!(matches!(outcome, ClaimOutcome::Empty));

    let listing = engine.dlq.list(None, 0, 10).await.expect("dlq list");
    assert_eq!(listing.total, 1);
    assert_eq!(listing.items[0].id, offered.id);
    assert_eq!(listing.items[0].reason, "delivery budget exhausted");

    // The original is gone from the queue.
    let stats = engine.work_queue.status(Some("rust")).await.expect("status");
    assert_eq!(stats[0].stats.messages, 0);
}

#[tokio::test]
async fn explicit_failure_retry_and_discard() {
    let (_, engine) = engine_with(vec![]);
    engine.init().await.expect("init");

    let sender = register(&engine, "tx", &[]).await;
    let claimer = register(&engine, "worker-1", &["rust"]).await;

    engine
        .work_queue
        .broadcast(&sender.guid, offer("rust", "flaky", 5))
        .await
        .expect("broadcast");
    let claimed = match engine
        .work_queue
        .claim(&claimer.guid, "rust", Some(Duration::from_millis(500)))
        .await
        .expect("claim")
    {
        ClaimOutcome::Claimed(item) => item,
        ClaimOutcome::Empty => panic!("expected claim"),
    };

    let record = engine
        .work_queue
        .fail_claimed(claimed.clone(), "compiler crashed", vec!["ICE".to_string()])
        .await
        .expect("fail");
    assert_eq!(record.id, claimed.id);
    assert_eq!(record.errors, vec!["ICE".to_string()]);

    // Filter by capability.
    let listing = engine.dlq.list(Some("rust"), 0, 10).await.expect("list");
    assert_eq!(listing.total, 1);
    let listing = engine.dlq.list(Some("go"), 0, 10).await.expect("list");
    assert_eq!(listing.total, 0);

    // Retry with reset republishes with attempts = 0 and empties the DLQ.
    let retried = engine
        .work_queue
        .retry_dead_letter(&claimed.id, true)
        .await
        .expect("retry");
    assert_eq!(retried.attempts, 0);
    assert_eq!(engine.dlq.list(None, 0, 10).await.expect("list").total, 0);

    // The retried item is claimable again.
    let reclaimed = match engine
        .work_queue
        .claim(&claimer.guid, "rust", Some(Duration::from_millis(500)))
        .await
        .expect("claim")
    {
        ClaimOutcome::Claimed(item) => item,
        ClaimOutcome::Empty => panic!("expected reclaim"),
    };
    assert_eq!(reclaimed.id, claimed.id);

    // Discard removes permanently.
    engine
        .work_queue
        .fail_claimed(reclaimed, "still broken", vec![])
        .await
        .expect("fail again");
    let discarded = engine
        .work_queue
        .discard_dead_letter(&claimed.id)
        .await
        .expect("discard");
    assert_eq!(discarded.id, claimed.id);
    assert_eq!(engine.dlq.list(None, 0, 10).await.expect("list").total, 0);

    // Mutations validate their ids.
    let err = engine
        .work_queue
        .retry_dead_letter("not-a-uuid", false)
        .await
        .expect_err("bad id");
    assert!(matches!(err, LoomError::Validation { .. }));
    let err = engine
        .work_queue
        .discard_dead_letter(&claimed.id)
        .await
        .expect_err("already discarded");
    assert!(matches!(err, LoomError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_read_windows_respect_retention() {
    let mut general = ChannelDescriptor::new("general", "team chat");
    general.retention.max_messages = 50;
    let mut tight = ChannelDescriptor::new("tight", "tiny retention");
    tight.retention.max_messages = 3;
    let (_, engine) = engine_with(vec![general, tight]);
    engine.init().await.expect("init");

    for i in 1..=100 {
        engine
            .channels
            .send("general", "worker-1", &format!("m{i}"))
            .await
            .expect("send");
        engine
            .channels
            .send("tight", "worker-1", &format!("t{i}"))
            .await
            .expect("send");
    }

    // firstSeq=51, lastSeq=100, limit 5 reads 96..100 ascending.
    let read = engine.channels.read("general", 5, 0).await.expect("read");
    let contents: Vec<&str> = read.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(contents, vec!["m96", "m97", "m98", "m99", "m100"]);

    // firstSeq=98, lastSeq=100, limit 10 never reads below firstSeq.
    let read = engine.channels.read("tight", 10, 0).await.expect("read");
    let contents: Vec<&str> = read.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(contents, vec!["t98", "t99", "t100"]);

    // Offset pages backwards.
    let read = engine.channels.read("general", 3, 5).await.expect("read");
    let contents: Vec<&str> = read.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(contents, vec!["m93", "m94", "m95"]);
}

#[tokio::test]
async fn channel_send_validations() {
    let (_, engine) = engine_with(vec![ChannelDescriptor::new("general", "chat")]);
    engine.init().await.expect("init");

    let err = engine
        .channels
        .send("nope", "worker-1", "hello")
        .await
        .expect_err("unknown channel");
    assert!(matches!(err, LoomError::NotFound { .. }));

    let err = engine
        .channels
        .send("general", "", "hello")
        .await
        .expect_err("missing handle");
    assert!(matches!(err, LoomError::Validation { .. }));

    let err = engine
        .channels
        .send("general", "worker-1", "   ")
        .await
        .expect_err("blank message");
    assert!(matches!(err, LoomError::Validation { .. }));

    let big = "x".repeat(1024 * 1024 + 1);
    let err = engine
        .channels
        .send("general", "worker-1", &big)
        .await
        .expect_err("oversized message");
    assert!(matches!(err, LoomError::Validation { .. }));
}

#[tokio::test]
async fn channel_status_and_empty_reads() {
    let (_, engine) = engine_with(vec![
        ChannelDescriptor::new("general", "chat"),
        ChannelDescriptor::new("quiet", "never used"),
    ]);
    engine.init().await.expect("init");

    assert!(engine.channels.read("quiet", 10, 0).await.expect("read").is_empty());

    engine
        .channels
        .send("general", "worker-1", "hello")
        .await
        .expect("send");

    let statuses = engine.channels.status(None).await.expect("status");
    assert_eq!(statuses.len(), 2);
    let general = statuses.iter().find(|s| s.name == "general").expect("general");
    assert_eq!(general.stats.messages, 1);
    let quiet = statuses.iter().find(|s| s.name == "quiet").expect("quiet");
    assert_eq!(quiet.stats.messages, 0);

    assert_eq!(engine.channels.list().len(), 2);
}
