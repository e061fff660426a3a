use super::*;
use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{CounterField, SubscriptionId},
    protocol::{ClientRequest, ServerEvent},
};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

async fn test_app() -> (Router, Storage, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", None, None).await.expect("user");
    let bob = storage.create_user("bob", None, None).await.expect("user");
    let state = AppState::new(
        ApiContext {
            storage: storage.clone(),
        },
        32,
    );
    (build_router(Arc::new(state)), storage, alice, bob)
}

fn increment_request(owner: UserId, actor: UserId, field: &str, delta: i64) -> Request<Body> {
    Request::post(format!(
        "/records/{}/counters/{field}/increment?user_id={}",
        owner.0, actor.0
    ))
    .header("content-type", "application/json")
    .body(Body::from(serde_json::json!({ "delta": delta }).to_string()))
    .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _storage, _alice, _bob) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn login_returns_session_user() {
    let (app, _storage, _alice, _bob) = test_app().await;
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "route-user", "display_name": "Route" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let dto: LoginResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(dto.user.display_name.as_deref(), Some("Route"));
}

#[tokio::test]
async fn increment_then_list_records_reports_new_values() {
    let (app, _storage, alice, bob) = test_app().await;

    let response = app
        .clone()
        .oneshot(increment_request(alice, alice, "count", 1))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let dto: IncrementResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(dto.value, 1);

    let response = app
        .clone()
        .oneshot(increment_request(bob, bob, "count", 4))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::get("/records?order_by=count")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let records: Vec<CounterRecord> = serde_json::from_slice(&body).expect("json");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].user_id, bob);
    assert_eq!(records[1].value(&CounterField::count()), 1);
}

#[tokio::test]
async fn cross_user_increment_is_forbidden() {
    let (app, storage, alice, bob) = test_app().await;
    let response = app
        .oneshot(increment_request(alice, bob, "count", 1))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(storage.load_record(alice).await.expect("load").is_none());
}

#[tokio::test]
async fn missing_record_and_bad_field_map_to_http_errors() {
    let (app, _storage, alice, _bob) = test_app().await;
    let request = Request::get(format!("/records/{}", alice.0))
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(increment_request(alice, alice, "9lives", 1))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_actor_is_unauthorized() {
    let (app, storage, alice, _bob) = test_app().await;
    let request = Request::post(format!("/records/{}/counters/count/increment", alice.0))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "delta": 1 }).to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let error: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(error.code, ErrorCode::Unauthorized);
    assert!(storage.load_record(alice).await.expect("load").is_none());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    match connect_async(format!("ws://{addr}/ws")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16());
        }
        other => panic!("unexpected handshake result: {:?}", other.map(|_| ())),
    }
}

async fn next_event<S>(ws: &mut S) -> ServerEvent
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("event before timeout")
            .expect("socket open")
            .expect("message");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("server event");
        }
    }
}

#[tokio::test]
async fn websocket_pushes_snapshots_after_increment() {
    let (app, _storage, alice, _bob) = test_app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server_app = app.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, server_app).await;
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?user_id={}", alice.0))
        .await
        .expect("connect");

    let subscribe_record = ClientRequest::SubscribeRecord {
        subscription_id: SubscriptionId(1),
        user_id: alice,
    };
    ws.send(WsMessage::Text(
        serde_json::to_string(&subscribe_record).expect("json"),
    ))
    .await
    .expect("send");
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::RecordSnapshot {
            subscription_id: SubscriptionId(1),
            record: None,
        }
    );

    let subscribe_collection = ClientRequest::SubscribeCollection {
        subscription_id: SubscriptionId(2),
        order_by: CounterField::count(),
    };
    ws.send(WsMessage::Text(
        serde_json::to_string(&subscribe_collection).expect("json"),
    ))
    .await
    .expect("send");
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::CollectionSnapshot {
            subscription_id: SubscriptionId(2),
            records: Vec::new(),
        }
    );

    let response = app
        .oneshot(increment_request(alice, alice, "count", 1))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    match next_event(&mut ws).await {
        ServerEvent::RecordSnapshot {
            subscription_id,
            record: Some(record),
        } => {
            assert_eq!(subscription_id, SubscriptionId(1));
            assert_eq!(record.value(&CounterField::count()), 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut ws).await {
        ServerEvent::CollectionSnapshot {
            subscription_id,
            records,
        } => {
            assert_eq!(subscription_id, SubscriptionId(2));
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].value(&CounterField::count()), 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn websocket_rejects_malformed_requests_without_closing() {
    let (app, _storage, alice, _bob) = test_app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?user_id={}", alice.0))
        .await
        .expect("connect");
    ws.send(WsMessage::Text("{\"type\":\"bogus\"}".to_string()))
        .await
        .expect("send");
    match next_event(&mut ws).await {
        ServerEvent::Error(error) => assert_eq!(error.code, ErrorCode::Validation),
        other => panic!("unexpected event: {other:?}"),
    }

    let subscribe = ClientRequest::SubscribeRecord {
        subscription_id: SubscriptionId(9),
        user_id: alice,
    };
    ws.send(WsMessage::Text(serde_json::to_string(&subscribe).expect("json")))
        .await
        .expect("send");
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::RecordSnapshot { .. }
    ));
}
