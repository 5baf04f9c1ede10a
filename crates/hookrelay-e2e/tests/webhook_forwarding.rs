//! Webhooks travelling relay -> tunnel client -> local service and back

use std::time::Duration;

use hookrelay_e2e::{MockHttpService, RelayOptions, TestRelay, TestTunnelClient};
use hookrelay_protocol::MAX_BODY_SIZE;
use hyper::StatusCode;

/// Initialize tracing and crypto provider for tests
fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("hookrelay=debug,hookrelay_server=debug,hookrelay_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_get_with_header_is_forwarded() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body("ok");

    let _client = TestTunnelClient::connect(&relay, relay.client_settings(&mock.url()))
        .await
        .expect("Failed to connect client");

    let resp = relay
        .http_client()
        .get(relay.webhook_url())
        .header("X-Test", "1")
        .send()
        .await
        .expect("Webhook call failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let requests = mock.get_requests();
    assert_eq!(requests.len(), 1, "Expected 1 request, got {}", requests.len());
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].header("x-test"), Some("1"));
    assert!(requests[0].body.is_empty());
}

#[tokio::test]
async fn test_post_body_status_and_headers_roundtrip() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::CREATED);
    mock.set_response_body(br#"{"id": 123}"#.to_vec());
    mock.add_response_header("Content-Type", "application/json");
    mock.add_response_header("Set-Cookie", "a=1");
    mock.add_response_header("Set-Cookie", "b=2");

    let _client = TestTunnelClient::connect(&relay, relay.client_settings(&mock.url()))
        .await
        .expect("Failed to connect client");

    let payload: Vec<u8> = (0u8..=255).collect();
    let resp = relay
        .http_client()
        .post(relay.webhook_url())
        .header("Content-Type", "application/octet-stream")
        .header("X-Hub-Signature", "sha256=abc")
        .body(payload.clone())
        .send()
        .await
        .expect("Webhook call failed");

    assert_eq!(resp.status(), 201);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    let cookies: Vec<_> = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(resp.text().await.unwrap(), r#"{"id": 123}"#);

    let recorded = mock.last_request().expect("No request recorded");
    assert_eq!(recorded.method, "POST");
    assert_eq!(recorded.body, payload);
    assert_eq!(recorded.header("x-hub-signature"), Some("sha256=abc"));
}

#[tokio::test]
async fn test_forward_url_is_used_as_is_by_default() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    let _client = TestTunnelClient::connect(
        &relay,
        relay.client_settings(&format!("{}/local/hook", mock.url())),
    )
    .await
    .expect("Failed to connect client");

    let resp = relay
        .http_client()
        .get(format!("{}?delivery=42", relay.webhook_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.last_request().unwrap().uri, "/local/hook");
}

#[tokio::test]
async fn test_preserve_path_appends_inbound_target() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_echo_uri(true);

    let mut settings = relay.client_settings(&format!("{}/local", mock.url()));
    settings.preserve_path = true;
    let _client = TestTunnelClient::connect(&relay, settings)
        .await
        .expect("Failed to connect client");

    let resp = relay
        .http_client()
        .get(format!("{}?delivery=42", relay.webhook_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "/local/webhook?delivery=42");
}

#[tokio::test]
async fn test_local_timeout_returns_500_and_tunnel_survives() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_delay(Duration::from_secs(3));

    let mut settings = relay.client_settings(&mock.url());
    settings.local_timeout = Duration::from_secs(1);
    let client = TestTunnelClient::connect(&relay, settings)
        .await
        .expect("Failed to connect client");

    let http = relay.http_client();
    let resp = http.get(relay.webhook_url()).send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("did not answer"), "body: {}", body);

    // Same connection, still usable
    assert_eq!(relay.active_connection_id(), Some(client.connection_id));
    mock.set_delay(Duration::ZERO);
    let resp = http.get(relay.webhook_url()).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_unreachable_local_service_returns_500() {
    init_test();

    let relay = TestRelay::start().await;
    // Grab a free port and release it so nothing is listening there
    let free_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let _client = TestTunnelClient::connect(
        &relay,
        relay.client_settings(&format!("http://127.0.0.1:{}", free_port)),
    )
    .await
    .expect("Failed to connect client");

    let resp = relay
        .http_client()
        .post(relay.webhook_url())
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    assert!(resp.text().await.unwrap().starts_with("Local call failed"));
    assert!(relay.registry.is_connected());
}

#[tokio::test]
async fn test_oversized_local_response_returns_500_and_tunnel_survives() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_response_body(vec![b'x'; MAX_BODY_SIZE + 1]);

    let client = TestTunnelClient::connect(&relay, relay.client_settings(&mock.url()))
        .await
        .expect("Failed to connect client");

    let http = relay.http_client();
    let resp = http.get(relay.webhook_url()).send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("response body too large"), "body: {}", body);

    // The tunnel that carried the 500 is still the registered one
    assert_eq!(relay.active_connection_id(), Some(client.connection_id));
    mock.set_response_body("small again");
    let resp = http.get(relay.webhook_url()).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "small again");
    assert_eq!(relay.active_connection_id(), Some(client.connection_id));
}

#[tokio::test]
async fn test_concurrent_webhooks_get_their_own_responses() {
    init_test();

    let relay = TestRelay::start().await;
    let mock = MockHttpService::start().await;
    mock.set_echo_uri(true);

    let mut settings = relay.client_settings(&mock.url());
    settings.preserve_path = true;
    let _client = TestTunnelClient::connect(&relay, settings)
        .await
        .expect("Failed to connect client");

    let http = relay.http_client();
    let mut calls = Vec::new();
    for i in 0..20 {
        let http = http.clone();
        let url = format!("{}?n={}", relay.webhook_url(), i);
        calls.push(tokio::spawn(async move {
            http.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), format!("/webhook?n={}", i));
    }
    assert_eq!(mock.get_requests().len(), 20);
}

#[tokio::test]
async fn test_webhook_over_tls_relay() {
    init_test();

    let relay = TestRelay::start_with(RelayOptions {
        tls: true,
        ..Default::default()
    })
    .await;
    let mock = MockHttpService::start().await;
    mock.set_response_body("secure ok");

    let _client = TestTunnelClient::connect(&relay, relay.client_settings(&mock.url()))
        .await
        .expect("Failed to connect over TLS");

    let resp = relay
        .http_client()
        .get(relay.webhook_url())
        .send()
        .await
        .expect("Webhook call failed");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secure ok");
}
