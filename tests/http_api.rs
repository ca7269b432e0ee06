//! HTTP surface tests.

use axum::http::{StatusCode, header};
use axum_test::{
    TestServer, WsMessage,
    multipart::{MultipartForm, Part},
};
use bytes::Bytes;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use thread_store::{
    models::progress::{Operation, ProgressEvent},
    routes::routes::routes,
    services::{StoreService, StoreSettings, Upload},
    transport::SqliteTransport,
};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

async fn test_store(part_size: usize) -> StoreService {
    let transport = SqliteTransport::in_memory()
        .await
        .expect("Failed to create test database");
    StoreService::new(
        Arc::new(transport),
        StoreSettings {
            part_size,
            pacing_pause: Duration::from_millis(1),
            ..StoreSettings::default()
        },
    )
}

/// Create a test server over an in-memory SQLite transport.
async fn create_test_server(part_size: usize) -> TestServer {
    TestServer::new(routes(test_store(part_size).await, BODY_LIMIT))
        .expect("Failed to create test server")
}

fn blob(name: &str, data: Vec<u8>) -> Upload {
    Upload {
        name: name.to_string(),
        content_type: None,
        data: Bytes::from(data),
        preview: None,
    }
}

async fn create_folder(server: &TestServer, name: &str) -> String {
    let response = server.post(&format!("/folder/{name}")).await;
    response.assert_status(StatusCode::CREATED);
    let body = response.json::<Value>();
    assert_eq!(body["name"], name);
    body["id"].as_str().unwrap().to_string()
}

async fn upload(server: &TestServer, folder_id: &str, name: &str, data: Vec<u8>) -> Value {
    let form = MultipartForm::new().add_part(
        "file",
        Part::bytes(data)
            .file_name(name.to_string())
            .mime_type("text/plain"),
    );
    let response = server
        .post(&format!("/upload/{folder_id}"))
        .multipart(form)
        .await;
    response.assert_status_ok();
    response.json::<Value>()
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = create_test_server(1024).await;

    let response = server.get("/healthz").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "ok");

    let response = server.get("/readyz").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["checks"]["transport"]["ok"], true);
}

#[tokio::test]
async fn test_upload_and_download_small_file() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "docs").await;

    let receipt = upload(&server, &folder_id, "ten.txt", b"0123456789".to_vec()).await;
    assert_eq!(receipt["filename"], "ten.txt");
    assert_eq!(receipt["message"], "File uploaded successfully: 10 bytes");
    let file_id = receipt["id"].as_str().unwrap();

    let response = server
        .get(&format!("/download/{folder_id}/{file_id}"))
        .await;
    response.assert_status_ok();
    assert_eq!(response.header(header::CONTENT_LENGTH), "10");
    assert_eq!(response.header(header::CONTENT_TYPE), "text/plain");
    assert_eq!(
        response.header(header::CONTENT_DISPOSITION),
        "attachment; filename=\"ten.txt\"; filename*=UTF-8''ten.txt"
    );
    assert_eq!(response.as_bytes().as_ref(), b"0123456789");
}

#[tokio::test]
async fn test_upload_and_download_multi_part_file() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "big").await;
    let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();

    let receipt = upload(&server, &folder_id, "big.log", data.clone()).await;
    assert_eq!(
        receipt["message"],
        "File uploaded successfully in 3 chunks: 2500 bytes"
    );
    let file_id = receipt["id"].as_str().unwrap();

    let response = server
        .get(&format!("/download/{folder_id}/{file_id}"))
        .await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), data.as_slice());
    assert_eq!(response.header(header::CONTENT_LENGTH), "2500");
}

#[tokio::test]
async fn test_upload_without_file_is_rejected() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "docs").await;

    let form = MultipartForm::new().add_text("note", "no file here");
    let response = server
        .post(&format!("/upload/{folder_id}"))
        .multipart(form)
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "No file uploaded");
}

#[tokio::test]
async fn test_folder_listing() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "listed").await;
    upload(&server, &folder_id, "a.txt", vec![1; 30]).await;
    upload(&server, &folder_id, "b.txt", vec![2; 12]).await;

    let response = server
        .get(&format!("/folder/{folder_id}"))
        .add_query_param("sort", "size")
        .add_query_param("order", "asc")
        .await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["folderName"], "listed");
    assert_eq!(body["folderSize"], 42);
    assert_eq!(body["files"][0]["fileName"], "b.txt");
    assert_eq!(body["files"][0]["fileSize"], 12);
    assert_eq!(body["files"][1]["fileName"], "a.txt");
    assert!(body["files"][0]["fileID"].is_string());
    assert!(body["files"][0]["dateCreated"].is_string());

    let response = server.get("/folders").await;
    response.assert_status_ok();
    let folders = response.json::<Value>();
    assert_eq!(folders.as_array().unwrap().len(), 1);
    assert_eq!(folders[0]["id"], folder_id.as_str());
    assert_eq!(folders[0]["folderSize"], 42);
}

#[tokio::test]
async fn test_rename_folder() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "before").await;

    let response = server
        .patch(&format!("/folder/{folder_id}"))
        .json(&json!({ "newName": "after" }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["name"], "after");

    let response = server
        .patch("/folder/unknown")
        .json(&json!({ "newName": "after" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_folder_then_404() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "temp").await;
    let first = upload(&server, &folder_id, "one.txt", vec![1; 10]).await;
    let second = upload(&server, &folder_id, "two.txt", vec![2; 2000]).await;

    server
        .delete(&format!("/folder/{folder_id}"))
        .await
        .assert_status_ok();

    server
        .get(&format!("/folder/{folder_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    for receipt in [first, second] {
        let file_id = receipt["id"].as_str().unwrap();
        server
            .get(&format!("/download/{folder_id}/{file_id}"))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
    server
        .delete(&format!("/folder/{folder_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_file() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "files").await;
    let receipt = upload(&server, &folder_id, "gone.txt", vec![0; 5]).await;
    let file_id = receipt["id"].as_str().unwrap();

    server
        .delete(&format!("/folder/{folder_id}/file/{file_id}"))
        .await
        .assert_status_ok();
    server
        .get(&format!("/download/{folder_id}/{file_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .delete(&format!("/folder/{folder_id}/file/{file_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let body = server.get(&format!("/folder/{folder_id}")).await.json::<Value>();
    assert_eq!(body["folderSize"], 0);
    assert_eq!(body["files"], json!([]));
}

#[tokio::test]
async fn test_preview_of_file_without_one_is_404() {
    let server = create_test_server(1024).await;
    let folder_id = create_folder(&server, "previews").await;
    let receipt = upload(&server, &folder_id, "plain.txt", vec![0; 5]).await;
    let file_id = receipt["id"].as_str().unwrap();

    server
        .get(&format!("/preview/{folder_id}/{file_id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_over_a_real_socket_completes() {
    let store = test_store(1024 * 1024).await;
    let folder = store.create_folder("net").await.unwrap();
    let stored = store
        .store_object(&folder.id, blob("net.bin", vec![7; 300_000]))
        .await
        .unwrap();
    let mut sub = store.progress().subscribe(&stored.id);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes(store.clone(), BODY_LIMIT);
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let url = format!("http://{addr}/download/{}/{}", folder.id, stored.id);
    let body = reqwest::get(url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body.len(), 300_000);

    let terminal = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match sub.recv().await {
                Some(event) if event.is_terminal() => break event,
                Some(_) => {}
                None => panic!("progress hub closed"),
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        terminal,
        ProgressEvent::Completed {
            operation: Operation::Download,
            ..
        }
    ));
}

#[tokio::test]
async fn test_progress_socket() {
    let store = test_store(1024).await;
    let server = TestServer::builder()
        .http_transport()
        .build(routes(store.clone(), BODY_LIMIT))
        .expect("Failed to create test server");
    let folder = store.create_folder("ws").await.unwrap();
    let first = store
        .store_object(&folder.id, blob("a.txt", b"first".to_vec()))
        .await
        .unwrap();
    let second = store
        .store_object(&folder.id, blob("b.txt", b"second".to_vec()))
        .await
        .unwrap();

    let mut everything = server.get_websocket("/ws").await.into_websocket().await;
    let mut filtered = server
        .get_websocket("/ws")
        .add_query_param("fileID", &second.id)
        .await
        .into_websocket()
        .await;

    for id in [&first.id, &second.id] {
        server
            .get(&format!("/download/{}/{id}", folder.id))
            .await
            .assert_status_ok();
    }

    let event = everything.receive_json::<Value>().await;
    assert_eq!(
        event,
        json!({ "type": "progressWithinLimit", "fileID": first.id, "progress": 100 })
    );
    let event = everything.receive_json::<Value>().await;
    assert_eq!(
        event,
        json!({ "type": "completed", "fileID": first.id, "operation": "download" })
    );

    // Only the second object's events reach the filtered socket.
    let event = filtered.receive_json::<Value>().await;
    assert_eq!(event["fileID"], second.id.as_str());
    assert_eq!(event["type"], "progressWithinLimit");
    let event = filtered.receive_json::<Value>().await;
    assert_eq!(event["type"], "completed");

    store.progress().close();
    assert!(matches!(
        filtered.receive_message().await,
        WsMessage::Close(_)
    ));
}
