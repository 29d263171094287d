//! End-to-end scenarios driven straight through the pipeline, without a
//! socket: login token minting, bearer reuse, CORS preflight, conditional
//! GET, login throttling and upload overrun.

use std::net::SocketAddr;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use haven_config::SiteConfig;
use haven_site::app::{HandlerRegistry, SharedContext, SiteApp};
use haven_site::pipeline;
use http_body_util::{BodyExt, Full};
use serde_json::{json, Value};

fn remote() -> SocketAddr {
    "203.0.113.7:40000".parse().unwrap()
}

/// Seed the user directory with alice (users) and bob, plus the recipes
/// the scenarios exercise.
fn write_users_db(dir: &Path, rounds: u32) -> std::path::PathBuf {
    let alice_hash = haven_auth::create_pw("s3cret", rounds);
    let bob_hash = haven_auth::create_pw("hunter2", rounds);
    let tree = json!({
        "recipes": [
            {
                "name": "userList",
                "auth": ["admin"],
                "expression": "$.users[?username==$0]",
                "filter": {"username": true, "member": true, "status": true},
                "defaults": {}
            },
            {
                "name": "users",
                "auth": ["manager"],
                "expression": "$.users",
                "filter": {"username": true, "member": true, "status": true, "email": true}
            },
            {
                "name": "names",
                "expression": "$.users.username"
            }
        ],
        "users": [
            {
                "username": "alice",
                "status": "ACTIVE",
                "member": ["users"],
                "email": "alice@example.net",
                "phone": "+15550001",
                "credentials": {"hash": alice_hash, "passcode": {}}
            },
            {
                "username": "bob",
                "status": "ACTIVE",
                "member": ["users", "admin"],
                "email": "bob@example.net",
                "phone": "+15550002",
                "credentials": {"hash": bob_hash, "passcode": {}}
            }
        ]
    });
    let path = dir.join("users.json");
    std::fs::write(&path, serde_json::to_string_pretty(&tree).unwrap()).unwrap();
    path
}

struct Fixture {
    app: SiteApp,
    _dir: tempfile::TempDir,
    temp_dir: std::path::PathBuf,
}

fn fixture() -> Fixture {
    // Low rounds keep the hashes cheap under test.
    let rounds = 64;
    let dir = tempfile::tempdir().unwrap();
    let users_path = write_users_db(dir.path(), rounds);

    let root = dir.path().join("www");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("index.html"), "<h1>hello</h1>".repeat(64)).unwrap();

    let temp_dir = dir.path().join("tmp");

    let site: SiteConfig = serde_json::from_value(json!({
        "name": "main",
        "host": "example.net",
        "port": 0,
        "auth": true,
        "root": root,
        "cors": {"origins": ["https://example.net"]},
        "databases": {"users": {"path": users_path}},
        "handlers": [
            {"code": "api", "route": "/*", "database": "users"}
        ]
    }))
    .unwrap();

    let shared = SharedContext {
        databases: Default::default(),
        headers: Default::default(),
        token: serde_json::from_value(json!({"secret": "test-secret", "rounds": rounds}))
            .unwrap(),
        limits: serde_json::from_value(json!({
            "request_max": 1048576,
            "upload_max": 10485760,
            "temp_dir": temp_dir,
        }))
        .unwrap(),
        mail: None,
        sms: None,
    };

    let app = SiteApp::build(&site, &shared, &HandlerRegistry::default()).unwrap();
    Fixture {
        app,
        _dir: dir,
        temp_dir,
    }
}

async fn send(
    fixture: &Fixture,
    req: http::Request<Full<Bytes>>,
) -> (http::StatusCode, http::HeaderMap, Bytes) {
    let response = pipeline::run(&fixture.app.scope, &fixture.app.routes, req, remote()).await;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("body collects").to_bytes();
    (parts.status, parts.headers, bytes)
}

fn basic(user: &str, pw: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{pw}")))
}

#[tokio::test]
async fn s1_login_mints_a_token() {
    let fx = fixture();
    let req = http::Request::get("/login")
        .header("host", "example.net")
        .header("authorization", basic("alice", "s3cret"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;

    assert_eq!(status, 200);
    let json: Value = serde_json::from_slice(&body).unwrap();
    let token = json["token"].as_str().unwrap();
    assert_eq!(json["payload"]["username"], "alice");
    assert_eq!(json["payload"]["member"], json!(["users"]));
    assert_eq!(json["payload"]["exp"], 604800);
    assert!(json["payload"]["iat"].as_i64().unwrap() > 0);
    assert_eq!(json["payload"]["ext"], true);
    assert_eq!(
        headers["authorization"].to_str().unwrap(),
        format!("Bearer {token}")
    );
    // The profile inside the token never carries credentials.
    assert!(json["payload"].get("credentials").is_none());
}

#[tokio::test]
async fn s2_bearer_reuse_hits_recipe_auth() {
    let fx = fixture();
    let req = http::Request::get("/login")
        .header("host", "example.net")
        .header("authorization", basic("alice", "s3cret"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (_, _, body) = send(&fx, req).await;
    let token = serde_json::from_slice::<Value>(&body).unwrap()["token"]
        .as_str()
        .unwrap()
        .to_string();

    // The token authenticates, but userList wants admin.
    let req = http::Request::get("/$userList/alice")
        .header("host", "example.net")
        .header("authorization", format!("Bearer {token}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 401);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], true);
    assert_eq!(json["code"], 401);
}

#[tokio::test]
async fn s2b_admin_bearer_passes_recipe_auth() {
    let fx = fixture();
    let req = http::Request::get("/login")
        .header("host", "example.net")
        .header("authorization", basic("bob", "hunter2"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (_, _, body) = send(&fx, req).await;
    let token = serde_json::from_slice::<Value>(&body).unwrap()["token"]
        .as_str()
        .unwrap()
        .to_string();

    let req = http::Request::get("/$userList/alice")
        .header("host", "example.net")
        .header("authorization", format!("Bearer {token}"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json[0]["username"], "alice");
    // The recipe filter keeps credentials out of the payload.
    assert!(json[0].get("credentials").is_none());
}

#[tokio::test]
async fn s3_cors_preflight() {
    let fx = fixture();
    let req = http::Request::builder()
        .method(http::Method::OPTIONS)
        .uri("/$x")
        .header("host", "example.net")
        .header("origin", "https://example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;

    assert_eq!(status, 204);
    assert!(body.is_empty());
    assert_eq!(
        headers["access-control-allow-origin"],
        "https://example.net"
    );
    assert_eq!(
        headers["access-control-allow-methods"],
        "POST, GET, OPTIONS"
    );
}

#[tokio::test]
async fn s3b_foreign_origin_is_refused() {
    let fx = fixture();
    let req = http::Request::get("/index.html")
        .header("host", "example.net")
        .header("origin", "https://evil.invalid")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = send(&fx, req).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn s4_conditional_get() {
    let fx = fixture();
    let req = http::Request::get("/index.html")
        .header("host", "example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;

    assert_eq!(status, 200);
    assert!(!body.is_empty());
    assert!(headers.contains_key("last-modified"));
    let etag = headers["etag"].to_str().unwrap().to_string();

    let req = http::Request::get("/index.html")
        .header("host", "example.net")
        .header("if-none-match", &etag)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 304);
    assert!(body.is_empty());
}

#[tokio::test]
async fn s4b_gzip_when_accepted() {
    let fx = fixture();
    let req = http::Request::get("/index.html")
        .header("host", "example.net")
        .header("accept-encoding", "gzip, deflate")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;
    assert_eq!(status, 200);
    assert_eq!(headers["content-encoding"], "gzip");
    assert!(headers["etag"].to_str().unwrap().contains("-gz"));
    assert!(body.len() < "<h1>hello</h1>".repeat(64).len());

    // Without Accept-Encoding the payload comes back identity.
    let req = http::Request::get("/index.html")
        .header("host", "example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (_, headers, _) = send(&fx, req).await;
    assert!(headers.get("content-encoding").is_none());
}

#[tokio::test]
async fn s5_throttled_login_locks_the_account() {
    let fx = fixture();
    for _ in 0..4 {
        let req = http::Request::get("/login")
            .header("host", "example.net")
            .header("authorization", basic("bob", "wrong"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, _, body) = send(&fx, req).await;
        assert_eq!(status, 401);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["msg"], "Authentication failed");
    }

    // Fifth attempt with the CORRECT password is still refused.
    let req = http::Request::get("/login")
        .header("host", "example.net")
        .header("authorization", basic("bob", "hunter2"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 401);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["msg"], "Account locked");
}

#[tokio::test]
async fn s6_upload_overrun_leaves_no_temp_file() {
    let fx = fixture();

    // One declared file part streaming 11 MiB against a 10 MiB ceiling.
    let mut raw = Vec::new();
    raw.extend_from_slice(b"--BOUND\r\n");
    raw.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"big.bin\"\r\n",
    );
    raw.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    raw.extend_from_slice(&vec![0u8; 11 * 1024 * 1024]);
    raw.extend_from_slice(b"\r\n--BOUND--\r\n");

    let req = http::Request::post("/up")
        .header("host", "example.net")
        .header("content-type", "multipart/form-data; boundary=BOUND")
        .body(Full::new(Bytes::from(raw)))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;

    assert_eq!(status, 413);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], true);

    // The partial temp file was unlinked on failure.
    let leftover = std::fs::read_dir(&fx.temp_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn head_matches_get_without_a_body() {
    let fx = fixture();
    let req = http::Request::builder()
        .method(http::Method::HEAD)
        .uri("/index.html")
        .header("host", "example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(&fx, req).await;
    assert_eq!(status, 200);
    assert!(headers.contains_key("etag"));
    assert!(body.is_empty());
}

#[tokio::test]
async fn unknown_route_is_a_canonical_404() {
    let fx = fixture();
    let req = http::Request::post("/no/such/route")
        .header("host", "example.net")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    // The open content route takes the POST but wants an upload body.
    assert_eq!(status, 400);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], true);
    assert_eq!(json["code"], 400);
}

#[tokio::test]
async fn info_endpoint_reports_ip_and_date() {
    let fx = fixture();
    let req = http::Request::get("/!info")
        .header("host", "example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ip"]["raw"], "203.0.113.7");
    assert_eq!(json["ip"]["port"], 40000);
    assert!(json["date"]["unix"].as_i64().unwrap() > 0);
    // Not server-authorized: no counters in the payload.
    assert!(json.get("statistics").is_none());
}

#[tokio::test]
async fn debug_flag_wraps_the_payload_in_context() {
    let fx = fixture();
    let req = http::Request::get("/!info!")
        .header("host", "example.net")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = send(&fx, req).await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["method"], "GET");
    assert_eq!(json["url"]["pathname"], "/!info");
    assert!(json["payload"]["ip"].is_object());
}
