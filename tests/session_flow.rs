//! End-to-end session and envelope behaviour over real sockets.

use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, COOKIE};
use reqwest::StatusCode;
use sdk_rust::{GatewayClient, INVALID_SESSION_ID, MISSING_SESSION_ID};
use serde_json::{json, Value};

mod common;

#[tokio::test]
async fn login_issues_a_fresh_token() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut client = GatewayClient::new(&gw.url(""));

    let reply = client.login("ada").await.unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.envelope.is_success());
    assert_eq!(reply.envelope.data, json!({"userId": 1, "username": "ada"}));

    let token = client.token().unwrap().to_owned();
    assert_eq!(token.len(), 43);
    assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

    let mut second = GatewayClient::new(&gw.url(""));
    second.login("ada").await.unwrap();
    assert_ne!(second.token(), Some(token.as_str()));

    gw.shutdown.trigger();
}

#[tokio::test]
async fn missing_and_invalid_tokens_use_envelope_codes() {
    let gw = common::start_gateway(common::test_config()).await;

    let anonymous = GatewayClient::new(&gw.url(""));
    let reply = anonymous.get("/api/visits").await.unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.envelope.code, MISSING_SESSION_ID);
    assert_eq!(reply.envelope.message, "missing token");
    assert_eq!(reply.envelope.data, json!({}));

    let forged = GatewayClient::new(&gw.url("")).with_token("not-a-real-session");
    let reply = forged.get("/api/visits").await.unwrap();
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.envelope.code, INVALID_SESSION_ID);
    assert_eq!(reply.envelope.message, "invalid token");

    gw.shutdown.trigger();
}

#[tokio::test]
async fn session_data_persists_across_requests() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut client = GatewayClient::new(&gw.url(""));
    client.login("grace").await.unwrap();

    for expected in 1..=3 {
        let reply = client.get("/api/visits").await.unwrap();
        assert_eq!(reply.envelope.data["visits"], expected);
    }

    let reply = client
        .put("/api/session", json!({ "data": { "theme": "dark" } }))
        .await
        .unwrap();
    assert_eq!(reply.envelope.data["theme"], "dark");

    let reply = client.get("/api/session").await.unwrap();
    assert_eq!(
        reply.envelope.data,
        json!({"userId": 2, "visits": 3, "theme": "dark"})
    );

    gw.shutdown.trigger();
}

#[tokio::test]
async fn token_travels_in_query_for_reads_and_body_for_writes() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut sdk = GatewayClient::new(&gw.url(""));
    sdk.login("ada").await.unwrap();
    let token = sdk.token().unwrap().to_owned();
    let http = common::client();

    let res = http
        .get(gw.url(&format!("/api/visits?token={token}")))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["visits"], 1);

    let res = http
        .put(gw.url("/api/session"))
        .json(&json!({ "token": token, "data": { "lang": "en" } }))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["lang"], "en");

    // Query strings do not carry ids for mutating methods.
    let res = http
        .delete(gw.url(&format!("/api/session?token={token}")))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], 11000);

    gw.shutdown.trigger();
}

#[tokio::test]
async fn logout_invalidates_the_session() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut client = GatewayClient::new(&gw.url(""));
    client.login("ada").await.unwrap();
    let token = client.token().unwrap().to_owned();

    let reply = client.logout().await.unwrap();
    assert!(reply.envelope.is_success());
    assert!(client.token().is_none());

    let stale = GatewayClient::new(&gw.url("")).with_token(token);
    let reply = stale.get("/api/session").await.unwrap();
    assert_eq!(reply.envelope.code, INVALID_SESSION_ID);

    gw.shutdown.trigger();
}

#[tokio::test]
async fn profile_requires_an_active_user() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut client = GatewayClient::new(&gw.url(""));
    client.login("ada").await.unwrap();

    let reply = client.get("/api/profile").await.unwrap();
    assert_eq!(reply.envelope.data["role"], "admin");
    assert_eq!(reply.envelope.data["regions"], json!(["eu", "us"]));

    let mut blocked = GatewayClient::new(&gw.url(""));
    let reply = blocked.login("mallory").await.unwrap();
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.envelope.code, 403);
    assert_eq!(reply.envelope.message, "Forbidden");
    assert!(blocked.token().is_none());

    gw.shutdown.trigger();
}

#[tokio::test]
async fn head_reports_length_without_body() {
    let gw = common::start_gateway(common::test_config()).await;
    let http = common::client();

    let get = http.get(gw.url("/api/ping")).send().await.unwrap();
    let length: usize = get.headers()[CONTENT_LENGTH].to_str().unwrap().parse().unwrap();
    let body = get.bytes().await.unwrap();
    assert_eq!(body.len(), length);
    assert_eq!(&body[..], br#"{"code":0,"message":"","data":{"pong":true}}"#);

    let head = http.head(gw.url("/api/ping")).send().await.unwrap();
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers()[CONTENT_LENGTH].to_str().unwrap(), length.to_string());
    assert!(head.bytes().await.unwrap().is_empty());

    gw.shutdown.trigger();
}

#[tokio::test]
async fn errors_are_enveloped() {
    let gw = common::start_gateway(common::test_config()).await;
    let http = common::client();

    let res = http.patch(gw.url("/api/ping")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"code": 405, "message": "Method Not Allowed", "data": {}}));

    let res = http
        .post(gw.url("/api/session"))
        .header("content-type", "application/json")
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Could not decode JSON");

    let res = http
        .post(gw.url("/api/session"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "Missing argument 'username'");

    gw.shutdown.trigger();
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let mut config = common::test_config();
    config.limits.max_body_size = 64;
    let gw = common::start_gateway(config).await;

    let res = common::client()
        .post(gw.url("/api/session"))
        .json(&json!({ "username": "x".repeat(256) }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], 413);

    gw.shutdown.trigger();
}

#[tokio::test]
async fn default_headers_and_request_id() {
    let gw = common::start_gateway(common::test_config()).await;
    let res = common::client().get(gw.url("/api/ping")).send().await.unwrap();

    let headers = res.headers();
    assert_eq!(headers["content-type"], "application/json; charset=UTF-8");
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "POST,GET,PUT,DELETE");
    assert!(headers.contains_key("date"));
    assert_eq!(headers["x-request-id"].to_str().unwrap().len(), 36);

    gw.shutdown.trigger();
}

#[tokio::test]
async fn reloaded_config_changes_session_field_name() {
    let gw = common::start_gateway(common::test_config()).await;
    let mut client = GatewayClient::new(&gw.url(""));
    client.login("ada").await.unwrap();
    let token = client.token().unwrap().to_owned();

    let mut config = common::test_config();
    config.session.session_id_name = "sid".into();
    gw.config_tx.send(config).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let http = common::client();
    let res = http
        .get(gw.url("/api/visits"))
        .header(COOKIE, format!("token={token}"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"code": 11000, "message": "missing sid", "data": {}}));

    let res = http
        .get(gw.url("/api/visits"))
        .header(COOKIE, format!("sid={token}"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["visits"], 1);

    gw.shutdown.trigger();
}

#[tokio::test]
async fn graceful_shutdown_stops_the_server() {
    let gw = common::start_gateway(common::test_config()).await;
    let res = common::client().get(gw.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    gw.shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), gw.handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}
