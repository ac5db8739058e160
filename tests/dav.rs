//! WebDAV frontend round-trips over a real bound server.

use rclonepool::config::Config;
use rclonepool::dav;
use rclonepool::pool::Pool;
use rclonepool::transport::localdir::LocalDirTransport;
use reqwest::Method;
use reqwest::StatusCode;
use std::sync::Arc;
use tempfile::TempDir;

struct Server {
    base: String,
    client: reqwest::Client,
    _tmp: TempDir,
}

async fn start_server() -> Server {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        remotes: vec!["r0:".into(), "r1:".into(), "r2:".into()],
        use_crypt: false,
        chunk_size: 100,
        temp_dir: tmp.path().join("tmp"),
        manifest_cache_dir: None,
        ..Config::default()
    };
    let transport = Arc::new(LocalDirTransport::new(tmp.path().join("remotes")));
    let pool = Arc::new(Pool::new(config, transport).await.unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, dav::router(pool)).await.unwrap();
    });

    Server {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn put(&self, path: &str, body: Vec<u8>) -> reqwest::Response {
        self.client
            .put(self.url(path))
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn put_head_get_round_trip() {
    let server = start_server().await;
    let body = vec![b'A'; 250];

    let response = server.put("/t/a.bin", body.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Overwriting an existing file answers 204.
    let response = server.put("/t/a.bin", body.clone()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = server
        .client
        .head(server.url("/t/a.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["Content-Length"], "250");
    assert_eq!(response.headers()["Accept-Ranges"], "bytes");
    assert!(response.headers().contains_key("Last-Modified"));

    let response = server
        .client
        .get(server.url("/t/a.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().to_vec(), body);
}

#[tokio::test]
async fn range_requests_answer_206_with_content_range() {
    let server = start_server().await;
    let body: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
    server.put("/t/a.bin", body.clone()).await;

    let response = server
        .client
        .get(server.url("/t/a.bin"))
        .header("Range", "bytes=100-149")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["Content-Range"], "bytes 100-149/250");
    assert_eq!(response.bytes().await.unwrap().to_vec(), &body[100..150]);

    // Suffix form: the final byte.
    let response = server
        .client
        .get(server.url("/t/a.bin"))
        .header("Range", "bytes=-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["Content-Range"], "bytes 249-249/250");
    assert_eq!(response.bytes().await.unwrap().to_vec(), &body[249..]);

    // Open-ended form from the last byte.
    let response = server
        .client
        .get(server.url("/t/a.bin"))
        .header("Range", "bytes=249-")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.bytes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn s4_unsatisfiable_range_answers_416() {
    let server = start_server().await;
    server.put("/t/a.bin", vec![b'A'; 250]).await;

    let response = server
        .client
        .get(server.url("/t/a.bin"))
        .header("Range", "bytes=300-400")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()["Content-Range"], "bytes */250");
}

#[tokio::test]
async fn options_advertises_dav() {
    let server = start_server().await;
    let response = server
        .client
        .request(Method::OPTIONS, server.url("/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["DAV"], "1, 2");
    let allow = response.headers()["Allow"].to_str().unwrap().to_string();
    for verb in ["PROPFIND", "MKCOL", "MOVE", "PUT", "DELETE"] {
        assert!(allow.contains(verb), "missing {verb} in {allow}");
    }
}

#[tokio::test]
async fn propfind_lists_the_tree() {
    let server = start_server().await;
    server.put("/a.bin", vec![1u8; 50]).await;
    server.put("/t/b.bin", vec![2u8; 150]).await;

    let propfind = Method::from_bytes(b"PROPFIND").unwrap();
    let response = server
        .client
        .request(propfind.clone(), server.url("/"))
        .header("Depth", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 207);
    let xml = response.text().await.unwrap();
    assert!(xml.contains("<D:href>/a.bin</D:href>"));
    assert!(xml.contains("<D:href>/t/</D:href>"));
    assert!(xml.contains("<D:getcontentlength>50</D:getcontentlength>"));
    assert!(!xml.contains("b.bin"), "depth 1 must not descend into /t");

    // Depth 0 only describes the resource itself.
    let response = server
        .client
        .request(propfind.clone(), server.url("/"))
        .header("Depth", "0")
        .send()
        .await
        .unwrap();
    let xml = response.text().await.unwrap();
    assert!(!xml.contains("a.bin"));

    // Anything else is refused.
    let response = server
        .client
        .request(propfind.clone(), server.url("/"))
        .header("Depth", "infinity")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A file path yields a single non-collection response.
    let response = server
        .client
        .request(propfind, server.url("/t/b.bin"))
        .header("Depth", "0")
        .send()
        .await
        .unwrap();
    let xml = response.text().await.unwrap();
    assert!(xml.contains("<D:resourcetype/>"));
    assert!(xml.contains("<D:getcontentlength>150</D:getcontentlength>"));
}

#[tokio::test]
async fn move_rewrites_the_path() {
    let server = start_server().await;
    server.put("/t/a.bin", vec![5u8; 120]).await;
    server.put("/t/c.bin", vec![6u8; 20]).await;

    let mv = Method::from_bytes(b"MOVE").unwrap();
    let response = server
        .client
        .request(mv.clone(), server.url("/t/a.bin"))
        .header("Destination", server.url("/u/b.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = server.client.get(server.url("/t/a.bin")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = server.client.get(server.url("/u/b.bin")).send().await.unwrap();
    assert_eq!(response.bytes().await.unwrap().to_vec(), vec![5u8; 120]);

    // Moving onto an existing file conflicts.
    let response = server
        .client
        .request(mv.clone(), server.url("/t/c.bin"))
        .header("Destination", server.url("/u/b.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Missing Destination header is a client error.
    let response = server
        .client
        .request(mv, server.url("/u/b.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_and_mkcol() {
    let server = start_server().await;
    server.put("/t/a.bin", vec![1u8; 10]).await;

    let response = server
        .client
        .delete(server.url("/t/a.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = server
        .client
        .delete(server.url("/t/a.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mkcol = Method::from_bytes(b"MKCOL").unwrap();
    let response = server
        .client
        .request(mkcol, server.url("/new-dir"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn directory_get_depends_on_accept() {
    let server = start_server().await;
    server.put("/t/a.bin", vec![1u8; 10]).await;

    let response = server
        .client
        .get(server.url("/t"))
        .header("Accept", "text/html,application/xhtml+xml")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    assert!(html.contains("a.bin"));

    let response = server.client.get(server.url("/t")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = server.client.get(server.url("/missing-dir")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
