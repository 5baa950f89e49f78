use drive_mirror::mirror::{Credentials, DriveSource, MirrorOptions, TaskState, mirror_tree};
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

async fn mount_listing(server: &MockServer, folder_id: &str, files: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("q", format!("'{folder_id}' in parents")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": files })))
        .mount(server)
        .await;
}

async fn mount_file(server: &MockServer, id: &str, body: &[u8], metadata: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/drive/v3/files/{id}")))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/drive/v3/files/{id}")))
        .and(query_param("fields", "id,md5Checksum,size"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata))
        .mount(server)
        .await;
}

fn source_for(server: &MockServer) -> DriveSource {
    DriveSource::new(Credentials {
        base_url: Url::parse(&server.uri()).unwrap(),
        token: "test-token".to_string(),
    })
}

#[tokio::test]
async fn mirrors_nested_tree_and_reports_verification() {
    let server = MockServer::start().await;
    let a_md5 = format!("{:x}", md5::compute(b"abcd"));

    mount_listing(
        &server,
        "root",
        json!([
            { "id": "a", "name": "A.txt", "mimeType": "text/plain", "size": "4", "md5Checksum": a_md5 },
            { "id": "sub", "name": "sub", "mimeType": FOLDER_MIME },
            { "id": "doc", "name": "Notes", "mimeType": "application/vnd.google-apps.document" }
        ]),
    )
    .await;
    mount_listing(
        &server,
        "sub",
        json!([
            { "id": "b", "name": "B.bin", "mimeType": "application/octet-stream", "size": "0", "md5Checksum": "" }
        ]),
    )
    .await;
    mount_file(&server, "a", b"abcd", json!({ "id": "a", "size": "4", "md5Checksum": a_md5 })).await;
    mount_file(&server, "b", b"", json!({ "id": "b", "size": "0", "md5Checksum": "" })).await;
    mount_file(&server, "doc", b"exported", json!({ "id": "doc" })).await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let report = mirror_tree(source_for(&server), "root", &out, MirrorOptions::default())
        .await
        .unwrap();

    assert!(out.join("A.txt").is_file());
    assert!(out.join("sub").is_dir());
    assert!(out.join("sub/B.bin").is_file());
    assert_eq!(report.task_for("a").unwrap().state, TaskState::Verified);
    // An empty checksum string is still a checksum, and it cannot match.
    assert_eq!(report.task_for("b").unwrap().state, TaskState::ChecksumMismatch);
    assert_eq!(report.task_for("doc").unwrap().state, TaskState::NotVerifiable);
    assert_eq!(report.stats.folders_expanded, 2);
}

#[tokio::test]
async fn checksum_mismatch_keeps_downloaded_bytes() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "root",
        json!([
            { "id": "a", "name": "A.txt", "mimeType": "text/plain", "size": "4", "md5Checksum": "abcd" }
        ]),
    )
    .await;
    mount_file(&server, "a", b"abcd", json!({ "id": "a", "size": "4", "md5Checksum": "abcd" })).await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let report = mirror_tree(source_for(&server), "root", &out, MirrorOptions::default())
        .await
        .unwrap();

    assert_eq!(report.task_for("a").unwrap().state, TaskState::ChecksumMismatch);
    assert_eq!(std::fs::read(out.join("A.txt")).unwrap(), b"abcd");
}

#[tokio::test]
async fn http_error_on_content_leaves_no_file() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "root",
        json!([
            { "id": "gone", "name": "gone.txt", "mimeType": "text/plain", "size": "3", "md5Checksum": "x" }
        ]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/gone"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let report = mirror_tree(source_for(&server), "root", &out, MirrorOptions::default())
        .await
        .unwrap();

    assert!(matches!(report.task_for("gone").unwrap().state, TaskState::Failed(_)));
    assert!(!out.join("gone.txt").exists());
}

#[tokio::test]
async fn same_named_files_both_land_on_disk() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "root",
        json!([
            { "id": "x1", "name": "x", "mimeType": "text/plain" },
            { "id": "x2", "name": "x", "mimeType": "text/plain" }
        ]),
    )
    .await;
    mount_file(&server, "x1", b"one", json!({ "id": "x1" })).await;
    mount_file(&server, "x2", b"two", json!({ "id": "x2" })).await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let report = mirror_tree(source_for(&server), "root", &out, MirrorOptions::default())
        .await
        .unwrap();

    let mut contents = vec![
        std::fs::read(out.join("x")).unwrap(),
        std::fs::read(out.join("x.1")).unwrap(),
    ];
    contents.sort();
    assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(report.tasks.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_and_folder_with_same_name_both_survive() {
    let server = MockServer::start().await;
    let plain_md5 = format!("{:x}", md5::compute(b"plain"));
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root' in parents"))
        .and(query_param("pageToken", "p2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "files": [{ "id": "dx", "name": "x", "mimeType": FOLDER_MIME }]
                }))
                .set_delay(Duration::from_millis(300)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root' in parents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextPageToken": "p2",
            "files": [
                { "id": "fx", "name": "x", "mimeType": "text/plain", "size": "5", "md5Checksum": plain_md5 }
            ]
        })))
        .with_priority(2)
        .mount(&server)
        .await;
    mount_listing(&server, "dx", json!([])).await;
    mount_file(&server, "fx", b"plain", json!({ "id": "fx", "size": "5", "md5Checksum": plain_md5 })).await;

    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let report = mirror_tree(source_for(&server), "root", &out, MirrorOptions::default())
        .await
        .unwrap();

    assert_eq!(report.task_for("fx").unwrap().state, TaskState::Verified);
    assert_eq!(std::fs::read(out.join("x")).unwrap(), b"plain");
    assert!(out.join("x.1").is_dir());
}
