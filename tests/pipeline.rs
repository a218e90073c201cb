//! End-to-end ingestion tests: fetch → dedup → filter chain → dispatch.
//!
//! Feeds are served by wiremock; deliveries go to a recording output.

mod common;

use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{eventually, rss, service, test_config, titles};
use feedrelay::aggregator::{AggregatorError, AggregatorState, IngestSummary};
use feedrelay::model::{FilterDef, NewFeed, OutputDef};

async fn feed_server(body: String) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "application/rss+xml"),
        )
        .mount(&server)
        .await;
    server
}

fn new_feed(server: &MockServer, delay_secs: Option<u64>) -> NewFeed {
    NewFeed {
        title: "Test Feed".into(),
        xml_url: format!("{}/feed.xml", server.uri()),
        delay_secs,
        ..NewFeed::default()
    }
}

#[tokio::test]
async fn test_skip_filter_routes_only_matching_entry() {
    let server = feed_server(rss(&[("e1", "SKIP me"), ("e2", "Post me")])).await;
    let (service, sent) = service(&test_config()).await;

    service
        .filters
        .add(FilterDef::new("no-skip", "condition").with_condition(r#"not (title contains "SKIP")"#))
        .await
        .unwrap();
    let output = service
        .outputs
        .add_output(OutputDef::new("record", "recording"))
        .await
        .unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, None)).await.unwrap();

    let summary = service.aggregator.poll_feed(&feed).await.unwrap();
    assert_eq!(
        summary,
        IngestSummary {
            received: 2,
            new: 2,
            forwarded: 1
        }
    );
    assert!(service.outputs.drain(Duration::from_secs(5)).await);
    assert_eq!(titles(&sent), vec!["Post me".to_string()]);

    let stored = service.outputs.get_output(output.id).await.unwrap();
    assert_eq!((stored.success_count, stored.error_count), (1, 0));
    let feed_state = service.aggregator.get_feed(feed.id).await.unwrap();
    assert_eq!(feed_state.items_processed, 2);
    assert_eq!(feed_state.error_count, 0);
}

#[tokio::test]
async fn test_second_poll_does_not_redeliver() {
    let server = feed_server(rss(&[("e1", "First"), ("e2", "Second")])).await;
    let (service, sent) = service(&test_config()).await;
    service
        .outputs
        .add_output(OutputDef::new("record", "recording"))
        .await
        .unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, None)).await.unwrap();

    service.aggregator.poll_feed(&feed).await.unwrap();
    let again = service.aggregator.poll_feed(&feed).await.unwrap();
    assert_eq!(again.new, 0);
    assert_eq!(again.forwarded, 0);

    assert!(service.outputs.drain(Duration::from_secs(5)).await);
    let mut delivered = titles(&sent);
    delivered.sort();
    assert_eq!(delivered, vec!["First".to_string(), "Second".to_string()]);

    // Forgetting the cache makes everything new again
    service.clear_cache().await.unwrap();
    assert_eq!(service.aggregator.poll_feed(&feed).await.unwrap().new, 2);
}

#[tokio::test]
async fn test_feeds_sharing_a_guid_both_deliver() {
    let first = feed_server(rss(&[("1", "From A")])).await;
    let second = feed_server(rss(&[("1", "From B")])).await;
    let (service, sent) = service(&test_config()).await;
    service
        .outputs
        .add_output(OutputDef::new("record", "recording"))
        .await
        .unwrap();
    let feed_a = service.aggregator.add_feed(new_feed(&first, None)).await.unwrap();
    let feed_b = service.aggregator.add_feed(new_feed(&second, None)).await.unwrap();

    assert_eq!(service.aggregator.poll_feed(&feed_a).await.unwrap().new, 1);
    assert_eq!(service.aggregator.poll_feed(&feed_b).await.unwrap().new, 1);
    // Still deduplicated within each feed
    assert_eq!(service.aggregator.poll_feed(&feed_b).await.unwrap().new, 0);

    assert!(service.outputs.drain(Duration::from_secs(5)).await);
    let mut delivered = titles(&sent);
    delivered.sort();
    assert_eq!(delivered, vec!["From A".to_string(), "From B".to_string()]);
}

#[tokio::test]
async fn test_unavailable_feed_fails_within_its_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let (service, _) = service(&test_config()).await;
    let feed = service
        .aggregator
        .add_feed(NewFeed {
            timeout_secs: Some(1),
            ..new_feed(&server, None)
        })
        .await
        .unwrap();

    let started = Instant::now();
    assert!(service.aggregator.poll_feed(&feed).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(service.aggregator.get_feed(feed.id).await.unwrap().error_count, 1);
}

#[tokio::test]
async fn test_output_condition_routes_per_destination() {
    let server = feed_server(rss(&[("e1", "Rust news"), ("e2", "Go news")])).await;
    let (service, sent) = service(&test_config()).await;
    service
        .outputs
        .add_output(OutputDef::new("rust-only", "recording").with_condition(r#"title contains "Rust""#))
        .await
        .unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, None)).await.unwrap();

    let summary = service.aggregator.poll_feed(&feed).await.unwrap();
    assert_eq!(summary.new, 2);
    assert_eq!(summary.forwarded, 1);
    assert!(service.outputs.drain(Duration::from_secs(5)).await);
    assert_eq!(titles(&sent), vec!["Rust news".to_string()]);
}

#[tokio::test]
async fn test_poll_loop_survives_fetch_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("e1", "Recovered")])))
        .mount(&server)
        .await;

    let (service, sent) = service(&test_config()).await;
    service
        .outputs
        .add_output(OutputDef::new("record", "recording"))
        .await
        .unwrap();
    service.aggregator.start().await.unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, Some(1))).await.unwrap();

    let (aggregator, feed_id) = (service.aggregator.clone(), feed.id);
    eventually("the failed fetch to be recorded", || {
        let aggregator = aggregator.clone();
        async move { aggregator.get_feed(feed_id).await.unwrap().error_count == 1 }
    })
    .await;
    eventually("the next tick to deliver", || {
        let sent = sent.clone();
        async move { titles(&sent) == vec!["Recovered".to_string()] }
    })
    .await;

    let recovered = service.aggregator.get_feed(feed.id).await.unwrap();
    assert_eq!(recovered.error_count, 0);
    assert!(recovered.last_error.is_none());

    service.aggregator.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_short_delivery() {
    let server = feed_server(rss(&[("e1", "Slow but fine")])).await;
    let (service, sent) = service(&test_config()).await;
    let output = service
        .outputs
        .add_output(OutputDef::new("slow", "recording").with_prop("delayMs", "200"))
        .await
        .unwrap();
    service.aggregator.start().await.unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, None)).await.unwrap();

    let (aggregator, feed_id) = (service.aggregator.clone(), feed.id);
    eventually("the first poll", || {
        let aggregator = aggregator.clone();
        async move { aggregator.get_feed(feed_id).await.unwrap().last_checked_at.is_some() }
    })
    .await;

    service.aggregator.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(service.aggregator.state(), AggregatorState::Stopped);
    assert_eq!(titles(&sent), vec!["Slow but fine".to_string()]);
    let stored = service.outputs.get_output(output.id).await.unwrap();
    assert_eq!((stored.success_count, stored.error_count), (1, 0));
}

#[tokio::test]
async fn test_shutdown_deadline_cancels_inflight_delivery() {
    let server = feed_server(rss(&[("e1", "Never arrives")])).await;
    let (service, sent) = service(&test_config()).await;
    let output = service
        .outputs
        .add_output(OutputDef::new("stuck", "recording").with_prop("delayMs", "20000"))
        .await
        .unwrap();
    service.aggregator.start().await.unwrap();
    let feed = service.aggregator.add_feed(new_feed(&server, None)).await.unwrap();

    let (aggregator, feed_id) = (service.aggregator.clone(), feed.id);
    eventually("the first poll", || {
        let aggregator = aggregator.clone();
        async move { aggregator.get_feed(feed_id).await.unwrap().last_checked_at.is_some() }
    })
    .await;

    let deadline = Duration::from_millis(300);
    let started = Instant::now();
    let result = service.aggregator.shutdown(deadline).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(AggregatorError::ShutdownTimeout(_))));
    assert_eq!(service.aggregator.state(), AggregatorState::Stopped);
    assert!(
        elapsed < deadline + Duration::from_millis(100),
        "shutdown took {elapsed:?}"
    );
    assert!(sent.lock().unwrap().is_empty());

    let stored = service.outputs.get_output(output.id).await.unwrap();
    assert_eq!((stored.success_count, stored.error_count), (0, 0));
    let persisted = service.db.get_output(output.id).await.unwrap().unwrap();
    assert_eq!((persisted.success_count, persisted.error_count), (0, 0));
}
