//! Unload, persistence and connectivity behaviour of the client

use mockito::{Mock, Server};
use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::{
    ChannelConfig, FileStorage, ManualConnectivity, MemoryStorage, MessageId, PreInitQueue,
    Storage, TelemetryClient, TelemetryItem,
};

const TRACK_PATH: &str = "/v2/track";

fn endpoint(server: &Server) -> String {
    format!("{}{}", server.url(), TRACK_PATH)
}

/// Log output for failing runs, filtered through `RUST_LOG`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Beacons are fire-and-forget, so wait for the request to show up
async fn wait_until_matched(mock: &Mock) {
    for _ in 0..100 {
        if mock.matched_async().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_unload_sends_pending_item_once() {
    init_tracing();
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .match_body(mockito::Matcher::Regex("going-away".to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ChannelConfig::builder().endpoint_url(endpoint(&server)).build();
    let client = TelemetryClient::builder().config(config).build().unwrap();

    client.track_event("going-away");
    let report = client.unload().await;
    assert_eq!(report.attempts, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(client.buffer_len(), 0);

    // A second unload has nothing left to do
    assert_eq!(client.unload().await.attempts, 0);

    wait_until_matched(&mock).await;
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unload_without_beacon_uses_keepalive_fetch() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ChannelConfig::builder()
        .endpoint_url(endpoint(&server))
        .is_beacon_api_disabled(true)
        .build();
    let client = TelemetryClient::builder().config(config).build().unwrap();

    client.track_event("bye");
    let report = client.on_visibility_hidden().await;

    // Fetch waits for the response, so the request has already landed
    mock.assert_async().await;
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn test_persisted_buffer_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::Regex("before-crash-1".to_string()),
            mockito::Matcher::Regex("before-crash-2".to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ChannelConfig::builder()
        .endpoint_url(endpoint(&server))
        .store_send_buffer(true)
        .build();

    {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());
        let client = TelemetryClient::builder()
            .config(config.clone())
            .storage(storage)
            .build()
            .unwrap();
        client.track_event("before-crash-1");
        client.track_event("before-crash-2");
        // Dropped without flushing
    }

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(dir.path()).unwrap());
    let client = TelemetryClient::builder()
        .config(config)
        .storage(storage.clone())
        .build()
        .unwrap();
    assert_eq!(client.restored_count(), 2);
    assert_eq!(client.buffer_len(), 2);

    let report = client.flush().await;
    mock.assert_async().await;
    assert_eq!(report.sent, 2);

    // Nothing left for a third instance
    let stored = storage.get_item("AI_buffer").unwrap().unwrap();
    assert_eq!(stored, "[]");
}

#[tokio::test]
async fn test_offline_skips_network_without_backoff() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let host = Arc::new(ManualConnectivity::new(Some(false)));
    let config = ChannelConfig::builder().endpoint_url(endpoint(&server)).build();
    let client = TelemetryClient::builder()
        .config(config)
        .connectivity(host.clone())
        .build()
        .unwrap();
    assert!(!client.is_online());

    client.track_event("offline");
    let report = client.flush().await;
    assert!(report.skipped);
    assert_eq!(report.attempts, 0);
    assert_eq!(client.buffer_len(), 1);

    host.set_online(true);
    let report = client.flush().await;
    assert_eq!(report.sent, 1);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_host_without_events_is_polled() {
    let server = Server::new_async().await;

    let host = Arc::new(ManualConnectivity::without_events(Some(true)));
    let config = ChannelConfig::builder().endpoint_url(endpoint(&server)).build();
    let client = TelemetryClient::builder()
        .config(config)
        .connectivity(host.clone())
        .build()
        .unwrap();

    assert!(client
        .diagnostics()
        .iter()
        .any(|m| m.id == MessageId::ConnectivityUnavailable));

    // Every check goes back to the host
    assert!(client.is_online());
    host.set_navigator_on_line(Some(false));
    assert!(!client.is_online());
}

#[tokio::test]
async fn test_disabled_telemetry_sends_nothing() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .expect(0)
        .create_async()
        .await;

    let config = ChannelConfig::builder()
        .endpoint_url(endpoint(&server))
        .disable_telemetry(true)
        .build();
    let client = TelemetryClient::builder().config(config).build().unwrap();

    client.track_event("ignored");
    client.track_metric("ignored", 1.0);
    assert_eq!(client.buffer_len(), 0);

    client.flush().await;
    mock.assert_async().await;
}

#[tokio::test]
async fn test_zero_sampling_keeps_metrics_only() {
    let server = Server::new_async().await;

    let config = ChannelConfig::builder()
        .endpoint_url(endpoint(&server))
        .sampling_percentage(0.0)
        .build();
    let client = TelemetryClient::builder().config(config).build().unwrap();

    client.track(TelemetryItem::event("sampled-out").with_tag("ai.user.id", "user-1"));
    client.track_metric("kept", 1.0);
    assert_eq!(client.buffer_len(), 1);
}

#[tokio::test]
async fn test_unacknowledged_items_are_reported_as_lost() {
    init_tracing();
    let mut server = Server::new_async().await;

    // The lost item and then the loss report itself both fail
    let mock = server
        .mock("POST", TRACK_PATH)
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let config = ChannelConfig::builder()
        .endpoint_url(endpoint(&server))
        .is_beacon_api_disabled(true)
        .build();
    let client = TelemetryClient::builder()
        .config(config)
        .storage(Arc::new(MemoryStorage::new()))
        .build()
        .unwrap();

    client.track_event("never-acknowledged");
    let report = client.on_visibility_hidden().await;

    mock.assert_async().await;
    assert_eq!(report.attempts, 2);
    assert!(client
        .diagnostics()
        .iter()
        .any(|m| m.id == MessageId::DataLoss));
}

#[tokio::test]
async fn test_pre_init_calls_reach_the_endpoint() {
    let mut server = Server::new_async().await;

    let mock = server
        .mock("POST", TRACK_PATH)
        .match_body(mockito::Matcher::Regex("early.*late".to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let queue = PreInitQueue::default();
    queue.call(|client| client.track_event("early")).unwrap();

    let config = ChannelConfig::builder().endpoint_url(endpoint(&server)).build();
    let client = Arc::new(TelemetryClient::builder().config(config).build().unwrap());
    queue.initialize(client.clone()).unwrap();
    queue.call(|client| client.track_event("late")).unwrap();

    let report = client.flush().await;
    mock.assert_async().await;
    assert_eq!(report.sent, 2);
}
