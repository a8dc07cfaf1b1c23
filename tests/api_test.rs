mod common;

use common::{pattern, Harness, PASSWORD, TOKEN, USERNAME};
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};
use swarmstream::prelude::*;

fn url(addr: std::net::SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

async fn error_kind(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn routes_require_a_token() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let response = client.get(url(addr, "/sessions")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_kind(response).await, "Unauthorized");

    let response = client
        .get(url(addr, "/files"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(url(addr, &format!("/sessions?token={TOKEN}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_issues_working_tokens() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let response = client
        .post(url(addr, "/api/login"))
        .json(&json!({ "username": USERNAME, "password": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body: Value = client
        .post(url(addr, "/api/login"))
        .json(&json!({ "username": USERNAME, "password": PASSWORD }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = body["token"].as_str().unwrap();
    assert_eq!(token.len(), 48);

    let response = client
        .get(url(addr, "/files"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let created: Value = client
        .post(url(addr, "/sessions"))
        .bearer_auth(TOKEN)
        .json(&json!({ "magnet": "magnet:?xt=urn:btih:abc123" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["id"], "abc123");
    assert_eq!(created["state"], "pending");
    assert_eq!(created["selectedIndex"], 0);
    assert!(created["files"].as_array().unwrap().is_empty());

    h.engine
        .metadata("abc123", "Movie", &[("sample.mp4", 1000), ("movie.mkv", 5000)]);
    h.wait_for_state("abc123", SessionState::MetadataKnown).await;

    let listed: Value = client
        .get(url(addr, "/sessions"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["selectedIndex"], 1);
    assert_eq!(listed[0]["name"], "Movie");

    let selected: Value = client
        .post(url(addr, "/sessions/abc123/select/not-a-number"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(selected["selectedIndex"], 0);

    let response = client
        .get(url(addr, "/sessions/abc123/stream"))
        .bearer_auth(TOKEN)
        .header(header::RANGE, "bytes=100-199")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 100);
    assert_eq!(&body[..], &pattern(1000)[100..200]);

    let response = client
        .get(url(addr, &format!("/sessions/abc123/stream?index=1&token={TOKEN}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.bytes().await.unwrap().len(), 5000);

    let response = client
        .get(url(addr, "/sessions/abc123/stream"))
        .bearer_auth(TOKEN)
        .header(header::RANGE, "bytes=1000-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    assert_eq!(error_kind(response).await, "RangeUnsatisfiable");

    let response = client
        .delete(url(addr, "/sessions/abc123"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = client
        .get(url(addr, "/sessions/abc123"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_kind(response).await, "NotFound");
}

#[tokio::test]
async fn abandoned_stream_does_not_block_removal() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let session = h.registry.create(common::magnet("def456"), None).await.unwrap();
    h.engine.metadata("def456", "Big", &[("big.mkv", 1_000_000)]);
    h.wait_for_state("def456", SessionState::MetadataKnown).await;

    let response = client
        .get(url(addr, "/sessions/def456/stream"))
        .bearer_auth(TOKEN)
        .header(header::RANGE, "bytes=0-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let mut body = response.bytes_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(body);

    let response = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client
            .delete(url(addr, "/sessions/def456"))
            .bearer_auth(TOKEN)
            .send(),
    )
    .await
    .expect("removal hung behind the abandoned stream")
    .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!session.storage_path.exists());
    assert!(h
        .engine
        .handle("def456")
        .destroyed
        .load(std::sync::atomic::Ordering::SeqCst));

    let response = client
        .get(url(addr, "/sessions/def456/stream"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn descriptor_upload_and_bad_requests() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let form = reqwest::multipart::Form::new().part(
        "torrent",
        reqwest::multipart::Part::bytes(b"desc01".to_vec()).file_name("release.torrent"),
    );
    let created: Value = client
        .post(url(addr, "/sessions"))
        .bearer_auth(TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["id"], "desc01");

    let response = client
        .post(url(addr, "/sessions"))
        .bearer_auth(TOKEN)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(response).await, "InvalidSource");

    let response = client
        .post(url(addr, "/sessions/unknown/select/0"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_browser_lists_streams_and_deletes() {
    let h = Harness::new();
    let addr = h.serve().await;
    let client = Client::new();

    let session = h
        .registry
        .create(common::magnet("fb1"), None)
        .await
        .unwrap();
    let dir_name = session
        .storage_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    tokio::fs::write(session.storage_path.join("clip.mp4"), pattern(1000))
        .await
        .unwrap();
    tokio::fs::write(session.storage_path.join("info.nfo"), b"x").await.unwrap();
    tokio::fs::write(session.storage_path.join("thumbnail.jpg"), b"jpeg")
        .await
        .unwrap();
    tokio::fs::create_dir_all(session.storage_path.join("thumbnails"))
        .await
        .unwrap();

    let files: Value = client
        .get(url(addr, "/files"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let files = files.as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], format!("{dir_name}/clip.mp4"));
    assert_eq!(files[0]["size"], 1000);
    assert_eq!(files[0]["type"], "video/mp4");
    assert_eq!(files[0]["thumbnail"], format!("/files/{dir_name}/thumbnail.jpg"));

    let response = client
        .get(url(addr, &format!("/files/{dir_name}/clip.mp4")))
        .bearer_auth(TOKEN)
        .header(header::RANGE, "bytes=-10")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 990-999/1000");
    assert_eq!(&response.bytes().await.unwrap()[..], &pattern(1000)[990..]);

    let response = client
        .get(url(addr, "/files/nothing/here.mkv"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .delete(url(addr, &format!("/files/{dir_name}")))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["sessions"], json!(["fb1"]));
    assert!(!session.storage_path.exists());
    assert!(h.registry.list().await.is_empty());
}

#[tokio::test]
async fn push_channel_sends_snapshot_then_updates() {
    let h = Harness::new();
    h.registry.create(common::magnet("ws1"), None).await.unwrap();
    let addr = h.serve().await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={TOKEN}"))
        .await
        .unwrap();

    let first = socket.next().await.unwrap().unwrap().into_text().unwrap();
    let first: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(first["type"], "progress");
    assert_eq!(first["sessions"][0]["id"], "ws1");

    h.broadcaster.push(&PushMessage::FileUpdated {
        path: "1/thumbnail.jpg".into(),
    });
    let next = socket.next().await.unwrap().unwrap().into_text().unwrap();
    let next: Value = serde_json::from_str(&next).unwrap();
    assert_eq!(next, json!({ "type": "fileUpdated", "path": "1/thumbnail.jpg" }));

    drop(socket);
    common::eventually(|| {
        let count = h.broadcaster.observer_count();
        async move { count == 0 }
    })
    .await;
}

#[tokio::test]
async fn push_channel_rejects_missing_token() {
    let h = Harness::new();
    let addr = h.serve().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}
