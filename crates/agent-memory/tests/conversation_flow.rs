mod common;

use agent_memory::{
    ConsolidationOutcome, ConversationStatus, MemoryError, Metadata, MetadataValue, NewKnowledgeEntry, Role,
    SearchQuery,
};
use common::{extractive, open_service, small_config};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::time::Duration;

#[tokio::test]
async fn concurrent_appends_keep_a_total_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = agent_memory::MemoryConfig {
        database_path: dir.path().join("memory.db"),
        ..Default::default()
    };
    let service = open_service(&dir, config, extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();

    let appends = (0..40).map(|i| {
        let service = &service;
        let id = conv.id.clone();
        async move {
            service
                .append_message(&id, Role::User, &format!("message {}", i), &Metadata::new())
                .await
        }
    });
    let results = join_all(appends).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let messages = service.list_messages(&conv.id, 100, None).await.unwrap();
    assert_eq!(messages.len(), 40);
    assert!(messages.windows(2).all(|w| w[0].id < w[1].id));

    // Listing twice gives the same order.
    let again = service.list_messages(&conv.id, 100, None).await.unwrap();
    assert_eq!(
        messages.iter().map(|m| m.id).collect::<Vec<_>>(),
        again.iter().map(|m| m.id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn paging_backward_walks_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();
    for i in 0..12 {
        service
            .append_message(&conv.id, Role::User, &format!("m{}", i), &Metadata::new())
            .await
            .unwrap();
    }

    let newest = service.list_messages(&conv.id, 5, None).await.unwrap();
    assert_eq!(newest.len(), 5);
    assert_eq!(newest.last().unwrap().content, "m11");

    let older = service
        .list_messages(&conv.id, 5, Some(newest[0].id))
        .await
        .unwrap();
    assert_eq!(older.len(), 5);
    assert_eq!(older[0].content, "m2");
    assert!(older.last().unwrap().id < newest[0].id);
}

#[tokio::test]
async fn appends_after_update_are_visible() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();

    // Populate the page cache, then append.
    assert!(service.list_messages(&conv.id, 10, None).await.unwrap().is_empty());
    service
        .append_message(&conv.id, Role::Agent, "hello", &Metadata::new())
        .await
        .unwrap();
    assert_eq!(service.list_messages(&conv.id, 10, None).await.unwrap().len(), 1);

    let archived = service.archive_conversation(&conv.id).await.unwrap();
    assert_eq!(archived.status, ConversationStatus::Archived);
    assert_eq!(
        service.get_conversation(&conv.id).await.unwrap().status,
        ConversationStatus::Archived
    );
}

#[tokio::test]
async fn annotations_merge_into_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("source".into(), MetadataValue::Text("web".into()));
    let appended = service
        .append_message(&conv.id, Role::User, "hi", &metadata)
        .await
        .unwrap();

    let mut extra = Metadata::new();
    extra.insert("sentiment".into(), MetadataValue::Text("positive".into()));
    let annotated = service.annotate_message(appended.message.id, &extra).await.unwrap();
    assert_eq!(annotated.metadata.len(), 2);
    assert_eq!(service.get_message(appended.message.id).await.unwrap(), annotated);
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();

    let err = service
        .append_message(&conv.id, Role::User, "", &Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    let err = service.list_messages(&conv.id, 0, None).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    let err = service
        .append_message("missing", Role::User, "hi", &Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { .. }));
}

#[tokio::test]
async fn length_bound_triggers_background_consolidation() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(&dir);
    let max_len = config.max_conversation_length;
    let service = open_service(&dir, config, extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();

    let mut scheduled = false;
    for i in 0..=max_len {
        let outcome = service
            .append_message(&conv.id, Role::User, &format!("message number {}", i), &Metadata::new())
            .await
            .unwrap();
        scheduled |= outcome.consolidation_scheduled;
    }
    assert!(scheduled);

    let mut summaries = Vec::new();
    for _ in 0..100 {
        summaries = service.list_summaries(&conv.id).await.unwrap();
        if !summaries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!summaries.is_empty());

    let live = service.list_messages(&conv.id, 1000, None).await.unwrap();
    assert!(live.len() < max_len);
    assert!(live.iter().all(|m| !summaries.iter().any(|s| s.covers(m.id))));

    // Summarized messages stay in the history.
    let history = service.list_message_history(&conv.id, 1000, None).await.unwrap();
    assert_eq!(history.len(), max_len + 1);
}

#[tokio::test]
async fn delete_removes_messages_and_summaries_but_keeps_knowledge() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    let conv = service.create_conversation("agent-1", "chat", &Metadata::new()).await.unwrap();
    service
        .append_message(&conv.id, Role::User, "fact: the deploy window is Friday", &Metadata::new())
        .await
        .unwrap();
    for i in 0..9 {
        service
            .append_message(&conv.id, Role::Agent, &format!("reply {}", i), &Metadata::new())
            .await
            .unwrap();
    }
    let history = service.list_message_history(&conv.id, 100, None).await.unwrap();
    let (start, end) = (history[0].id, history[history.len() - 1].id);
    let outcome = service.consolidate_range(&conv.id, start, end).await.unwrap();
    let ConsolidationOutcome::Completed(report) = outcome else {
        panic!("expected a completed consolidation");
    };
    assert_eq!(report.knowledge_created, 1);

    let summaries = service.list_summaries(&conv.id).await.unwrap();
    let knowledge_id = summaries[0].knowledge_entry_ids[0].clone();

    service.delete_conversation(&conv.id).await.unwrap();

    assert!(matches!(
        service.get_conversation(&conv.id).await,
        Err(MemoryError::NotFound { .. })
    ));
    assert!(matches!(
        service.list_messages(&conv.id, 10, None).await,
        Err(MemoryError::NotFound { .. })
    ));
    assert!(matches!(
        service.list_summaries(&conv.id).await,
        Err(MemoryError::NotFound { .. })
    ));
    let entry = service.get_knowledge(&knowledge_id).await.unwrap();
    assert_eq!(entry.title, "the deploy window is Friday");

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.conversations, 0);
    assert_eq!(stats.messages, 0);
    assert_eq!(stats.summaries, 0);
    assert_eq!(stats.knowledge_items, 1);
}

#[tokio::test]
async fn exact_title_match_ranks_first() {
    let dir = tempfile::tempdir().unwrap();
    let service = open_service(&dir, small_config(&dir), extractive());
    for (title, content) in [
        ("Ownership rules in Rust", "rust ownership borrowing rust ownership lifetimes"),
        ("Rust ownership", "short note"),
        ("Borrow checker", "rust ownership rust ownership rust ownership"),
    ] {
        service
            .create_knowledge(NewKnowledgeEntry {
                category: "facts".into(),
                title: title.into(),
                content: content.into(),
                tags: BTreeSet::from(["rust".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let results = service
        .search_knowledge(&SearchQuery {
            query: "rust ownership".into(),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(results[0].entry.title, "Rust ownership");
    assert!(results[0].exact_title);
    assert!(results.windows(2).skip(1).all(|w| w[0].score >= w[1].score));

    let filtered = service
        .search_knowledge(&SearchQuery {
            query: "rust ownership".into(),
            tags: BTreeSet::from(["RUST".to_string(), "missing".to_string()]),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(filtered.is_empty());
}
