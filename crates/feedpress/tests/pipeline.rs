//! End-to-end flows through ingestion, automation, stages and publication.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;

use feedpress::events::{ArticleStatusChanged, PublicationFailed};
use feedpress::model::FeedItemStatus;
use feedpress::publish::{Disposition, PublishOptions};
use feedpress::store::ArticleStore;
use feedpress::{
    advance_article, AdminFacade, ArticleStatus, ExecuteOptions, PublicationStatus,
    PublishContent, PublishMetadata, PublishRequest, PublishTarget, RawFeedItem, StageResult,
};
use feedpress_testing::{raw_item, rule_on_new_items, EventRecorder, Harness};

#[tokio::test]
async fn manual_source_waits_for_a_human() {
    let h = Harness::new();
    let source = h.source_with_flags(false, false).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;

    h.services
        .ingestion()
        .ingest(source.id, vec![raw_item("a", "Quarterly results")])
        .await
        .unwrap();

    let articles = h.store.articles_for_source(source.id);
    assert_eq!(articles.len(), 1);
    let article = &articles[0];
    assert_eq!(article.status, ArticleStatus::Generated);
    assert_eq!(article.title, "Article: Quarterly results");

    // No stage picks up a `generated` article on its own.
    h.services.image_stage().run_batch().await.unwrap();
    h.services.publish_stage().run_batch().await.unwrap();
    let unchanged = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, ArticleStatus::Generated);
    assert_eq!(h.images.call_count(), 0);
    h.publisher.assert_call_count(0);

    let approved = advance_article(
        &h.services.stores,
        &h.services.bus,
        article.id,
        StageResult::ApprovedForPublish,
    )
    .await
    .unwrap();
    assert_eq!(approved.status, ArticleStatus::ReadyToPublish);

    // Goes to the source's default target.
    let report = h.services.publish_stage().run_batch().await.unwrap();
    assert_eq!(report.advanced, [article.id]);
    let published = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(published.status, ArticleStatus::Published);
}

#[tokio::test]
async fn full_automation_skips_generated_with_image() {
    let h = Harness::new();
    let changes = EventRecorder::<ArticleStatusChanged>::new();
    h.services.bus.subscribe::<ArticleStatusChanged, _>(changes.clone());

    let source = h.source_with_flags(true, true).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;

    h.services
        .ingestion()
        .ingest(source.id, vec![raw_item("a", "Launch day")])
        .await
        .unwrap();
    let article = h.store.articles_for_source(source.id).remove(0);
    assert_eq!(article.status, ArticleStatus::GeneratedImageDraft);

    h.services.image_stage().run_batch().await.unwrap();
    let after_image = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(after_image.status, ArticleStatus::ReadyToPublish);
    assert!(after_image.featured_media.is_some());

    h.services.publish_stage().run_batch().await.unwrap();
    let published = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(published.status, ArticleStatus::Published);
    h.publisher.assert_call_count(1);

    let path: Vec<ArticleStatus> = changes.events().iter().map(|c| c.to).collect();
    assert_eq!(
        path,
        [ArticleStatus::ReadyToPublish, ArticleStatus::Published]
    );
    assert!(!path.contains(&ArticleStatus::GeneratedWithImage));
}

#[tokio::test]
async fn duplicate_guids_and_urls_are_inserted_once() {
    let h = Harness::new();
    let source = h.source_with_flags(false, false).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;

    let batch = vec![
        RawFeedItem::with_guid("a"),
        RawFeedItem::with_guid("a"),
        RawFeedItem::with_url("x"),
    ];
    let report = h.services.ingestion().ingest(source.id, batch).await.unwrap();
    assert_eq!(report.inserted_count(), 2);
    assert_eq!(report.duplicates, 1);

    // Overlapping second poll: only the unseen item is new.
    let report = h
        .services
        .ingestion()
        .ingest(
            source.id,
            vec![RawFeedItem::with_url("x"), raw_item("b", "Fresh")],
        )
        .await
        .unwrap();
    assert_eq!(report.inserted_count(), 1);

    assert_eq!(h.store.feed_items_for_source(source.id).len(), 3);
    h.generator.assert_call_count(3);
}

#[tokio::test]
async fn overlapping_concurrent_polls_never_duplicate() {
    let h = Harness::new();
    let source = h.source_with_flags(false, false).await;

    let first: Vec<RawFeedItem> = (0..20).map(|i| raw_item(&format!("g{i}"), "t")).collect();
    let second: Vec<RawFeedItem> = (10..30).map(|i| raw_item(&format!("g{i}"), "t")).collect();

    let gate = h.services.ingestion();
    let (a, b) = tokio::join!(gate.ingest(source.id, first), gate.ingest(source.id, second));
    assert_eq!(a.unwrap().inserted_count() + b.unwrap().inserted_count(), 30);

    let items = h.store.feed_items_for_source(source.id);
    let guids: HashSet<_> = items.iter().filter_map(|i| i.guid.clone()).collect();
    assert_eq!(guids.len(), items.len());
}

#[tokio::test]
async fn failed_generation_leaves_item_pending() {
    let h = Harness::new();
    let source = h.source_with_flags(false, false).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;
    h.generator.push_failure("model overloaded");

    h.services
        .ingestion()
        .ingest(source.id, vec![raw_item("a", "Outage")])
        .await
        .unwrap();

    assert!(h.store.articles_for_source(source.id).is_empty());
    let items = h.store.feed_items_for_source(source.id);
    assert_eq!(items[0].status, FeedItemStatus::Pending);
    assert_eq!(items[0].article_id, None);
}

#[tokio::test]
async fn second_publish_returns_existing_publication() {
    let h = Harness::new();
    let source = h.source_with_flags(false, true).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;
    h.services
        .ingestion()
        .ingest(source.id, vec![raw_item("a", "News")])
        .await
        .unwrap();
    let article = h.store.articles_for_source(source.id).remove(0);

    let orchestrator = h.services.orchestrator();
    let request = PublishRequest {
        article_id: article.id,
        target: PublishTarget::new("wordpress", "site-1"),
        content: PublishContent {
            title: article.title.clone(),
            content: article.content.clone(),
            ..PublishContent::default()
        },
        metadata: PublishMetadata::default(),
        options: PublishOptions::default(),
    };

    let first = orchestrator.publish(request.clone()).await.unwrap();
    let second = orchestrator.publish(request).await.unwrap();

    assert_eq!(first.status, PublicationStatus::Completed);
    assert_eq!(second.publication_id, first.publication_id);
    assert_eq!(second.disposition, Disposition::Existing);
    h.publisher.assert_call_count(1);
}

#[tokio::test]
async fn failed_publish_is_recovered_by_the_retry_sweep() {
    let h = Harness::new();
    let failures = EventRecorder::<PublicationFailed>::new();
    h.services.bus.subscribe::<PublicationFailed, _>(failures.clone());

    let source = h.source_with_flags(false, true).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;
    h.services
        .ingestion()
        .ingest(source.id, vec![raw_item("a", "News")])
        .await
        .unwrap();
    let article = h.store.articles_for_source(source.id).remove(0);
    assert_eq!(article.status, ArticleStatus::ReadyToPublish);

    h.publisher.fail_next(1);
    let report = h.services.publish_stage().run_batch().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(failures.len(), 1);
    assert!(failures.events()[0].retry_eligible);

    let waiting = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, ArticleStatus::ReadyToPublish);

    let sweep = h.services.sweeper().sweep(Utc::now()).await.unwrap();
    assert_eq!(sweep.retried.len(), 1);
    assert_eq!(sweep.retried[0].status, PublicationStatus::Completed);
    assert_eq!(sweep.retried[0].retry_count, 1);

    let published = h.store.find_article(article.id).await.unwrap().unwrap();
    assert_eq!(published.status, ArticleStatus::Published);
    h.publisher.assert_call_count(2);
}

#[tokio::test]
async fn dry_run_ingest_reports_without_writing() {
    let h = Harness::new();
    let source = h.source_with_flags(true, true).await;
    h.add_rule(rule_on_new_items(source.id, &["GENERATE_ARTICLE"])).await;
    let facade = AdminFacade::with_default_use_cases(h.services.clone());

    let result = facade
        .execute(
            "ingest_feed_items",
            json!({
                "sourceId": source.id,
                "items": [{ "guid": "a", "title": "Hello", "content": "World" }]
            }),
            ExecuteOptions {
                dry_run: true,
                ..ExecuteOptions::default()
            },
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.unwrap()["inserted"].as_array().unwrap().len(), 1);
    assert!(h.store.feed_items_for_source(source.id).is_empty());
    assert!(h.store.articles_for_source(source.id).is_empty());
    h.generator.assert_call_count(0);
    h.publisher.assert_call_count(0);
}
