//! End-to-end gateway scenarios: raw messages delivered to a mail source,
//! processed through the batch runner, asserted against the ticket host
//! and the mailbox dispositions.

use mailgate::test_support::{
    MemoryDirectory, MemoryMailSource, MemoryTicketHost, memory_store,
};
use mailgate::{
    BatchSummary, GatewayConfig, GatewayError, MailboxProcessor, ThreadingEngine, TicketStatus,
};

fn raw_message(message_id: &str, references: Option<&str>, body: &str) -> Vec<u8> {
    let mut msg = format!(
        "Message-ID: {}\r\nSubject: Printer broken\r\nFrom: Requester <requester@example.com>\r\nDate: Tue, 2 Jul 2013 10:00:00 +0200\r\n",
        message_id
    );
    if let Some(refs) = references {
        msg.push_str(&format!("References: {}\r\n", refs));
    }
    msg.push_str("\r\n");
    msg.push_str(body);
    msg.into_bytes()
}

async fn engine() -> ThreadingEngine {
    let config = GatewayConfig {
        source_id: 1,
        ..GatewayConfig::default()
    };
    ThreadingEngine::new(memory_store().await, config)
}

#[tokio::test]
async fn new_ticket_followup_then_duplicate() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    // Email A: no references, starts the conversation.
    source.deliver("uid-a", &raw_message("<a1@x>", None, "help please"));
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(source.disposition_of("uid-a"), Some(Some("accepted".into())));

    // Email B replies to A while the ticket is open.
    source.deliver("uid-b", &raw_message("<b1@x>", Some("<a1@x>"), "more info"));
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();
    assert_eq!(summary.followups, 1);
    assert_eq!(summary.created, 0);
    assert_eq!(source.disposition_of("uid-b"), Some(Some("accepted".into())));

    // Email C re-delivers A's exact message id.
    source.deliver("uid-c", &raw_message("<a1@x>", None, "help please"));
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.followups, 0);
    assert_eq!(source.disposition_of("uid-c"), Some(Some("refused".into())));

    assert_eq!(host.ticket_count(), 1);
    assert_eq!(host.all_followups().len(), 1);
}

#[tokio::test]
async fn reply_to_closed_ticket_creates_linked_ticket() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver("uid-a", &raw_message("<a1@x>", None, "help"));
    processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    // Close the ticket, then a late reply arrives.
    let records = engine.store().records_for_ticket(100).await.unwrap();
    assert!(!records.is_empty());
    host.set_status(100, TicketStatus::Closed);

    source.deliver("uid-d", &raw_message("<d1@x>", Some("<a1@x>"), "again"));
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    assert_eq!(summary.reopened, 1);
    assert_eq!(host.ticket_count(), 2);
    assert!(host.followups_for(100).is_empty());
    assert_eq!(host.linked_ticket(101), Some(100));

    // D's keys bind to the new ticket, not the closed one.
    assert_eq!(
        engine
            .store()
            .find_bound(&["<d1@x>".into()], 1)
            .await
            .unwrap(),
        Some(101)
    );
}

#[tokio::test]
async fn rebind_closure_makes_every_key_resolve() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver(
        "uid-a",
        &raw_message("<a1@x>", Some("<r1@x> <r2@x> <r3@x>"), "help"),
    );
    processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    // A later email quoting any single one of A's keys resolves to the
    // same ticket.
    for (uid, key) in [("uid-1", "<r1@x>"), ("uid-2", "<r2@x>"), ("uid-3", "<r3@x>")] {
        source.deliver(uid, &raw_message(&format!("<m-{}@x>", uid), Some(key), "re"));
    }
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    assert_eq!(summary.followups, 3);
    assert_eq!(host.ticket_count(), 1);
}

#[tokio::test]
async fn from_directive_overrides_requester_only_on_unique_match() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    let jane = directory.add_user("Doe", "Jane", "jane.doe@example.com");

    source.deliver(
        "uid-a",
        &raw_message(
            "<a1@x>",
            None,
            "##From: Doe, Jane <jane.doe@example.com>\nsent on behalf",
        ),
    );
    // Unknown address: directive silently skipped.
    source.deliver(
        "uid-b",
        &raw_message(
            "<b1@x>",
            None,
            "##From: Ghost, Casper <casper@example.com>\nboo",
        ),
    );
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(host.requester_override(100), Some(jane));
    assert_eq!(host.requester_override(101), None);
}

#[tokio::test]
async fn connection_failure_aborts_batch_without_state() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver("uid-a", &raw_message("<a1@x>", None, "help"));
    source.fail_connections(true);

    let err = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Connection(_)));

    // Nothing processed, nothing written, message still in the inbox.
    assert_eq!(host.ticket_count(), 0);
    assert_eq!(source.disposition_of("uid-a"), None);
    assert_eq!(
        engine
            .store()
            .find_bound(&["<a1@x>".into()], 1)
            .await
            .unwrap(),
        None
    );

    // Next scheduled run recovers.
    source.fail_connections(false);
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
}

#[tokio::test]
async fn scheduled_poll_logs_and_returns_empty_summary_on_failure() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();
    source.fail_connections(true);

    let summary = processor.poll(&source, &host, &directory).await;
    assert_eq!(summary, BatchSummary::default());
}

#[tokio::test]
async fn interactive_session_is_borrowed_not_closed() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver("uid-a", &raw_message("<a1@x>", None, "help"));

    let mut session = mailgate::mailbox::MailSource::connect(&source).unwrap();
    let summary = processor
        .run_batch(&source, Some(&mut session), &host, &directory)
        .await
        .unwrap();

    assert_eq!(summary.created, 1);
    // The interactive caller owns the session; the runner must not have
    // closed it.
    assert_eq!(source.sessions_closed(), 0);
}

#[tokio::test]
async fn owned_session_closed_even_after_batch() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver("uid-a", &raw_message("<a1@x>", None, "help"));
    processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    assert_eq!(source.sessions_closed(), 1);
}

#[tokio::test]
async fn unparseable_message_is_refused_and_batch_continues() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    // No Message-ID header at all.
    source.deliver("uid-bad", b"Subject: hmm\r\nFrom: a@b.c\r\n\r\nbody");
    source.deliver("uid-good", &raw_message("<g1@x>", None, "help"));

    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    assert_eq!(summary.refused, 1);
    assert_eq!(summary.created, 1);
    assert_eq!(
        source.disposition_of("uid-bad"),
        Some(Some("refused".into()))
    );
}

#[tokio::test]
async fn purge_unlinks_destroyed_ticket() {
    let engine = engine().await;
    let processor = MailboxProcessor::new(&engine);
    let host = MemoryTicketHost::new();
    let directory = MemoryDirectory::new();
    let source = MemoryMailSource::new();

    source.deliver("uid-a", &raw_message("<a1@x>", Some("<r1@x>"), "help"));
    processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();

    // Host permanently destroys the ticket and notifies the gateway.
    engine.on_ticket_purged(100).await.unwrap();

    // A reply to the purged conversation starts a fresh ticket.
    source.deliver("uid-b", &raw_message("<b1@x>", Some("<a1@x>"), "re"));
    let summary = processor
        .run_batch(&source, None, &host, &directory)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.followups, 0);
}
