//! Integration tests for the Mercure hub
//!
//! These drive the axum router directly: publish with form POSTs, subscribe
//! with GETs and read the server-sent event stream frame by frame.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use mercure::auth::{Claims, JwtKey, MercureClaim};
use mercure::hub::{Hub, HubConfig};
use mercure::transport::{BoltOptions, BoltTransport, LocalTransport, TransportSubscribers};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tower::ServiceExt;

const SECRET: &str = "!ChangeThisMercureHubJWTSecretKey!";

fn token(publish: &[&str], subscribe: &[&str]) -> String {
    let claims = Claims {
        mercure: Some(MercureClaim {
            publish: Some(publish.iter().map(|s| s.to_string()).collect()),
            subscribe: Some(subscribe.iter().map(|s| s.to_string()).collect()),
            payload: Some(serde_json::json!({"user": "alice"})),
        }),
        ..Default::default()
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn config() -> HubConfig {
    let key = JwtKey::from_config(SECRET, "HS256").unwrap();
    HubConfig {
        publisher_jwt: Some(key.clone()),
        subscriber_jwt: Some(key),
        heartbeat: Duration::ZERO,
        ..Default::default()
    }
}

fn local_hub(config: HubConfig) -> Hub {
    Hub::new(config, Arc::new(LocalTransport::new())).unwrap()
}

async fn publish(router: &Router, jwt: &str, form: &str) -> (StatusCode, String) {
    let request = Request::post("/.well-known/mercure")
        .header(header::AUTHORIZATION, format!("Bearer {}", jwt))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn subscribe_request(query: &str, jwt: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::get(format!("/.well-known/mercure?{}", query));
    match jwt {
        Some(jwt) => builder.header(header::AUTHORIZATION, format!("Bearer {}", jwt)),
        None => builder,
    }
}

/// Read the event stream until `needle` shows up
async fn read_until(body: &mut Body, needle: &str) -> String {
    let mut received = String::new();
    while !received.contains(needle) {
        let frame = timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("timed out waiting for the event stream")
            .expect("event stream ended")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            received.push_str(std::str::from_utf8(&data).unwrap());
        }
    }
    received
}

#[tokio::test]
async fn test_health() {
    let router = local_hub(config()).router();
    let response = router
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_private_publish_and_subscribe() {
    let router = local_hub(config()).router();

    let subscriber_jwt = token(&[], &["https://ex/1"]);
    let response = router
        .clone()
        .oneshot(subscribe_request("topic=https%3A%2F%2Fex%2F1", Some(&subscriber_jwt)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert!(response.headers().get("last-event-id").is_none());
    let mut body = response.into_body();

    let (status, id) = publish(
        &router,
        &token(&["https://ex/1"], &[]),
        "topic=https%3A%2F%2Fex%2F1&private=on&data=hi",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(id.starts_with("urn:uuid:"));

    let received = read_until(&mut body, "data: hi\n\n").await;
    assert!(received.starts_with(":\n"));
    assert!(received.contains(&format!("id: {}\ndata: hi\n\n", id)));
}

#[tokio::test]
async fn test_private_update_not_delivered_to_other_selector() {
    let router = local_hub(config()).router();
    let publisher_jwt = token(&["*"], &[]);

    let response = router
        .clone()
        .oneshot(
            subscribe_request("topic=https%3A%2F%2Fex%2F1", Some(&token(&[], &["https://ex/2"])))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let (status, _) = publish(&router, &publisher_jwt, "topic=https%3A%2F%2Fex%2F1&private=on&data=hi").await;
    assert_eq!(status, StatusCode::OK);

    // Updates are delivered in dispatch order, so the public one arriving
    // first proves the private one was filtered out
    let (status, _) = publish(&router, &publisher_jwt, "topic=https%3A%2F%2Fex%2F1&data=public").await;
    assert_eq!(status, StatusCode::OK);

    let received = read_until(&mut body, "data: public\n\n").await;
    assert!(!received.contains("data: hi"));
}

#[tokio::test]
async fn test_template_selector_and_multiline_data() {
    let router = local_hub(config()).router();

    let response = router
        .clone()
        .oneshot(
            subscribe_request("topic=https%3A%2F%2Fex%2Fbooks%2F%7Bid%7D", Some(&token(&[], &[])))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let mut body = response.into_body();

    let (status, _) = publish(
        &router,
        &token(&["*"], &[]),
        "topic=https%3A%2F%2Fex%2Fbooks%2F42&id=book-42&type=updated&retry=3000&data=line1%0Aline2",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let received = read_until(&mut body, "data: line2\n\n").await;
    assert!(received.contains("event: updated\nretry: 3000\nid: book-42\ndata: line1\ndata: line2\n\n"));
}

#[tokio::test]
async fn test_publish_validation() {
    let router = local_hub(config()).router();
    let jwt = token(&["*"], &[]);

    let (status, body) = publish(&router, &jwt, "data=no+topic").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Missing \"topic\" parameter");

    let (status, body) = publish(&router, &jwt, "topic=t&retry=soon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid \"retry\" parameter");

    let (status, id) = publish(&router, &jwt, "topic=t&id=custom").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(id, "custom");
}

#[tokio::test]
async fn test_publish_authorization() {
    let router = local_hub(config()).router();

    // No token at all
    let request = Request::post("/.well-known/mercure")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("topic=t"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Token without publish selectors
    let claims = Claims {
        mercure: Some(MercureClaim::default()),
        ..Default::default()
    };
    let jwt = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
    let (status, _) = publish(&router, &jwt, "topic=t").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Every topic must be covered
    let jwt = token(&["https://ex/1"], &[]);
    let (status, _) = publish(&router, &jwt, "topic=https%3A%2F%2Fex%2F1&topic=https%3A%2F%2Fex%2F2&private=on").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = publish(&router, &jwt, "topic=https%3A%2F%2Fex%2F2").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Signed with another key
    let forged = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"another secret key, long enough")).unwrap();
    let (status, _) = publish(&router, &forged, "topic=t").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_public_publish_outside_claims_with_v7_compatibility() {
    let router = local_hub(HubConfig {
        protocol_version_compatibility: Some(7),
        ..config()
    })
    .router();
    let jwt = token(&["https://ex/1"], &[]);

    let (status, _) = publish(&router, &jwt, "topic=https%3A%2F%2Fex%2F2").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = publish(&router, &jwt, "topic=https%3A%2F%2Fex%2F2&private=on").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_subscribe_validation() {
    let router = local_hub(config()).router();

    let response = router
        .clone()
        .oneshot(subscribe_request("topic=t", None).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(subscribe_request("foo=bar", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Missing \"topic\" parameter.");
}

#[tokio::test]
async fn test_anonymous_subscriber_gets_public_updates_only() {
    let hub = local_hub(HubConfig {
        anonymous: true,
        ..config()
    });
    let router = hub.router();

    let response = router
        .clone()
        .oneshot(subscribe_request("topic=*", None).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let jwt = token(&["*"], &[]);
    publish(&router, &jwt, "topic=a&private=on&data=secret").await;
    publish(&router, &jwt, "topic=b&data=public").await;

    let received = read_until(&mut body, "data: public").await;
    assert!(!received.contains("secret"));
}

#[tokio::test]
async fn test_unknown_last_event_id() {
    let dir = tempfile::tempdir().unwrap();
    let transport = BoltTransport::open(dir.path().join("updates.db"), BoltOptions::default()).unwrap();
    let hub = Hub::new(config(), Arc::new(transport)).unwrap();
    let router = hub.router();
    let publisher_jwt = token(&["*"], &[]);

    let (status, _) = publish(&router, &publisher_jwt, "topic=t&id=a&data=first").await;
    assert_eq!(status, StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            subscribe_request("topic=t", Some(&token(&[], &[])))
                .header("Last-Event-ID", "x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["last-event-id"], "a");
    let mut body = response.into_body();

    publish(&router, &publisher_jwt, "topic=t&id=b&data=live").await;

    let received = read_until(&mut body, "data: live\n\n").await;
    assert!(!received.contains("data: first"));
    assert!(received.contains("id: b\n"));
}

#[tokio::test]
async fn test_history_replay_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let transport = BoltTransport::open(dir.path().join("updates.db"), BoltOptions::default()).unwrap();
    let router = Hub::new(config(), Arc::new(transport)).unwrap().router();
    let publisher_jwt = token(&["*"], &[]);

    for id in ["a", "b", "c"] {
        publish(&router, &publisher_jwt, &format!("topic=t&id={}&data={}", id, id)).await;
    }

    // The query parameter works like the header
    let response = router
        .clone()
        .oneshot(
            subscribe_request("topic=t&lastEventID=a", Some(&token(&[], &[])))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["last-event-id"], "c");
    let mut body = response.into_body();

    publish(&router, &publisher_jwt, "topic=t&id=d&data=d").await;

    let received = read_until(&mut body, "id: d\n").await;
    let ids: Vec<&str> = received.lines().filter_map(|l| l.strip_prefix("id: ")).collect();
    assert_eq!(ids, vec!["b", "c", "d"]);
}

#[tokio::test]
async fn test_disconnect_removes_subscriber() {
    let transport = Arc::new(LocalTransport::new());
    let router = Hub::new(config(), transport.clone()).unwrap().router();

    let response = router
        .clone()
        .oneshot(subscribe_request("topic=t", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(transport.subscribers().unwrap().1.len(), 1);

    drop(response);

    timeout(Duration::from_secs(5), async {
        while !transport.subscribers().unwrap().1.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber still registered after the client left");
}

#[tokio::test]
async fn test_write_timeout_closes_the_stream() {
    let router = local_hub(HubConfig {
        write_timeout: Duration::from_millis(200),
        dispatch_timeout: Duration::from_millis(50),
        ..config()
    })
    .router();

    let response = router
        .oneshot(subscribe_request("topic=t", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let body = timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("stream should end once the connection lifetime is reached")
        .unwrap()
        .to_bytes();
    assert_eq!(&body[..], b":\n");
}

#[tokio::test]
async fn test_heartbeat() {
    let router = local_hub(HubConfig {
        heartbeat: Duration::from_millis(50),
        ..config()
    })
    .router();

    let response = router
        .oneshot(subscribe_request("topic=t", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body();

    let received = read_until(&mut body, ":\n:\n:\n").await;
    assert!(received.chars().all(|c| c == ':' || c == '\n'));
}

mod subscriptions {
    use super::*;

    fn subscriptions_hub() -> Hub {
        local_hub(HubConfig {
            subscriptions: true,
            ..config()
        })
    }

    async fn get(router: &Router, uri: &str, jwt: &str, if_none_match: Option<&str>) -> (StatusCode, axum::http::HeaderMap, String) {
        let mut builder = Request::get(uri).header(header::AUTHORIZATION, format!("Bearer {}", jwt));
        if let Some(etag) = if_none_match {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }

        let response = router.clone().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let router = local_hub(config()).router();
        let (status, _, _) = get(&router, "/.well-known/mercure/subscriptions", &token(&[], &["*"]), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_collection_and_single() {
        let hub = subscriptions_hub();
        let router = hub.router();
        let admin = token(&["*"], &["/.well-known/mercure/subscriptions{/topic}{/subscriber}"]);

        let response = router
            .clone()
            .oneshot(subscribe_request("topic=https%3A%2F%2Fex%2F1", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let _stream = response.into_body();

        let (status, headers, body) = get(&router, "/.well-known/mercure/subscriptions", &admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/ld+json");

        let document: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(document["@context"], "https://mercure.rocks/");
        assert_eq!(document["type"], "Subscriptions");
        assert_eq!(document["id"], "/.well-known/mercure/subscriptions");

        let subscriptions = document["subscriptions"].as_array().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0]["topic"], "https://ex/1");
        assert_eq!(subscriptions[0]["active"], true);
        assert_eq!(subscriptions[0]["payload"]["user"], "alice");

        // Single subscription, addressed by its id
        let id = subscriptions[0]["id"].as_str().unwrap();
        let (status, _, body) = get(&router, id, &admin, None).await;
        assert_eq!(status, StatusCode::OK);
        let subscription: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(subscription["@context"], "https://mercure.rocks/");
        assert_eq!(subscription["type"], "Subscription");
        assert_eq!(subscription["lastEventID"], document["lastEventID"]);

        // Filtered by topic
        let (_, _, body) = get(
            &router,
            "/.well-known/mercure/subscriptions/https%3A%2F%2Fex%2F2",
            &admin,
            None,
        )
        .await;
        let filtered: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(filtered["subscriptions"].as_array().unwrap().is_empty());

        let (status, _, _) = get(
            &router,
            "/.well-known/mercure/subscriptions/https%3A%2F%2Fex%2F1/urn%3Auuid%3Aunknown",
            &admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_etag() {
        let hub = subscriptions_hub();
        let router = hub.router();
        let admin = token(&["*"], &["/.well-known/mercure/subscriptions{/topic}{/subscriber}"]);

        let (status, headers, _) = get(&router, "/.well-known/mercure/subscriptions", &admin, None).await;
        assert_eq!(status, StatusCode::OK);
        let etag = headers[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(etag, "\"earliest\"");

        let (status, _, body) = get(&router, "/.well-known/mercure/subscriptions", &admin, Some(&etag)).await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());

        hub.publish(mercure::Update::new(vec!["t".into()], "changed")).await.unwrap();
        let (status, _, _) = get(&router, "/.well-known/mercure/subscriptions", &admin, Some(&etag)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requires_matching_selector() {
        let router = subscriptions_hub().router();

        let (status, _, _) = get(
            &router,
            "/.well-known/mercure/subscriptions",
            &token(&[], &["https://ex/1"]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_subscription_events() {
        let hub = subscriptions_hub();
        let router = hub.router();

        // A privileged subscriber watching subscription events
        let watcher = router
            .clone()
            .oneshot(
                subscribe_request(
                    "topic=%2F.well-known%2Fmercure%2Fsubscriptions%7B%2Ftopic%7D%7B%2Fsubscriber%7D",
                    Some(&token(&[], &["/.well-known/mercure/subscriptions{/topic}{/subscriber}"])),
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        let mut events = watcher.into_body();

        let response = router
            .clone()
            .oneshot(subscribe_request("topic=https%3A%2F%2Fex%2F1", Some(&token(&[], &[]))).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let received = read_until(&mut events, "\"active\": true").await;
        assert!(received.contains("data:   \"topic\": \"https://ex/1\","));

        drop(response);
        read_until(&mut events, "\"active\": false").await;
    }
}
