use std::{collections::HashMap, io::Cursor, net::SocketAddr, sync::Arc};

use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use qircard::{
    build_router,
    config::Config,
    qr::{ErrorCorrection, QrError, QrMatrix, QrRenderer, StandardRenderer},
    reduce::MAX_UPLOAD_BYTES,
    state::AppState,
    store::MemoryStore,
};

const PASSWORD: &str = "correct horse battery";

/// Behaves like a symbol that holds at most `limit` bytes.
struct SmallSymbolRenderer {
    limit: usize,
}

impl QrRenderer for SmallSymbolRenderer {
    fn encode(&self, payload: &str, ecc: ErrorCorrection) -> Result<QrMatrix, QrError> {
        if payload.len() > self.limit {
            return Err(QrError::CapacityExceeded {
                len: payload.len(),
                ecc,
            });
        }
        StandardRenderer.encode(payload, ecc)
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

async fn app() -> SocketAddr {
    serve(build_router(AppState::with_store(
        Config::default(),
        Arc::new(MemoryStore::new()),
    )))
    .await
}

struct Reply {
    status: u16,
    /// Lowercased header names.
    headers: HashMap<String, String>,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("json body")
    }
}

async fn send_raw(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<String>,
) -> Reply {
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    if let Some(token) = token {
        req.push_str(&format!("Authorization: Bearer {token}\r\n"));
    }
    let body = body.unwrap_or_default();
    if !body.is_empty() {
        req.push_str("Content-Type: application/json\r\n");
    }
    req.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));

    let mut stream = TcpStream::connect(addr).await.expect("connect server");
    stream.write_all(req.as_bytes()).await.expect("write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");

    let (head, body) = response
        .split_once("\r\n\r\n")
        .expect("http response separator");
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .expect("status");
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    Reply {
        status,
        headers,
        body: body.to_string(),
    }
}

async fn send(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Reply {
    send_raw(addr, method, path, token, body.map(|b| b.to_string())).await
}

/// Registers and signs in, returning `(unique_id, token)`.
async fn sign_up(app: SocketAddr, email: &str) -> (String, String) {
    let reply = send(
        app,
        "POST",
        "/api/users",
        None,
        Some(json!({ "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(reply.status, 201);
    let id = reply.json()["uniqueId"].as_str().unwrap().to_string();

    let reply = send(
        app,
        "POST",
        "/api/auth/signin",
        None,
        Some(json!({ "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(reply.status, 200);
    let token = reply.json()["token"].as_str().unwrap().to_string();

    (id, token)
}

fn png_data_url(width: u32, height: u32) -> String {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(bytes))
}

#[tokio::test]
async fn test_healthz() {
    let reply = send(app().await, "GET", "/healthz", None, None).await;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "ok");
}

#[tokio::test]
async fn test_registration_rules() {
    let app = app().await;
    let (_, _) = sign_up(app, "ada@example.com").await;

    let duplicate = send(
        app,
        "POST",
        "/api/users",
        None,
        Some(json!({ "email": "ADA@example.com", "password": PASSWORD })),
    )
    .await;
    assert_eq!(duplicate.status, 409);

    let missing = send(
        app,
        "POST",
        "/api/users",
        None,
        Some(json!({ "email": "grace@example.com" })),
    )
    .await;
    assert_eq!(missing.status, 400);
    assert_eq!(missing.json()["error"], "Email and password are required");

    let weak = send(
        app,
        "POST",
        "/api/users",
        None,
        Some(json!({ "email": "grace@example.com", "password": "short" })),
    )
    .await;
    assert_eq!(weak.status, 400);
}

#[tokio::test]
async fn test_signin_rejects_bad_credentials() {
    let app = app().await;
    sign_up(app, "ada@example.com").await;

    for body in [
        json!({ "email": "ada@example.com", "password": "not the password" }),
        json!({ "email": "nobody@example.com", "password": PASSWORD }),
    ] {
        let reply = send(app, "POST", "/api/auth/signin", None, Some(body)).await;
        assert_eq!(reply.status, 401);
        assert_eq!(reply.json()["error"], "Invalid email or password");
    }
}

#[tokio::test]
async fn test_protected_routes_need_a_session() {
    let app = app().await;

    let reply = send(app, "GET", "/api/profile", None, None).await;
    assert_eq!(reply.status, 401);

    let reply = send(app, "GET", "/api/profile", Some("forged"), None).await;
    assert_eq!(reply.status, 401);

    let reply = send(
        app,
        "POST",
        "/api/generate-qr",
        None,
        Some(json!({ "name": "Ada" })),
    )
    .await;
    assert_eq!(reply.status, 401);
}

#[tokio::test]
async fn test_generate_qr_returns_png_and_saves_profile() {
    let app = app().await;
    let (id, token) = sign_up(app, "ada@example.com").await;

    let reply = send(app, "GET", "/api/profile", Some(&token), None).await;
    assert_eq!(reply.status, 404);

    let reply = send(
        app,
        "POST",
        "/api/generate-qr",
        Some(&token),
        Some(json!({
            "name": "Ada Lovelace",
            "phone": "+44 20 7946 0000",
            "company": "Analytical Engines",
            "title": "Programmer",
        })),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.headers["cache-control"], "no-store");

    let body = reply.json();
    assert_eq!(body["tier"], "full");
    assert_eq!(
        body["profileUrl"],
        format!("http://localhost:3000/contact/{id}")
    );

    let qr_code = body["qrCode"].as_str().unwrap();
    let png = STANDARD
        .decode(qr_code.strip_prefix("data:image/png;base64,").unwrap())
        .unwrap();
    let image = image::load_from_memory(&png).unwrap();
    assert_eq!(image.width(), image.height());
    assert_eq!(image.width() % 10, 0);

    let reply = send(app, "GET", "/api/profile", Some(&token), None).await;
    assert_eq!(reply.status, 200);
    let profile = reply.json();
    assert_eq!(profile["name"], "Ada Lovelace");
    assert_eq!(profile["email"], "ada@example.com");
    assert_eq!(profile["company"], "Analytical Engines");
}

#[tokio::test]
async fn test_generate_qr_falls_back_to_simple_card() {
    let state = AppState::with_parts(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(SmallSymbolRenderer { limit: 600 }),
    );
    let app = serve(build_router(state)).await;
    let (id, token) = sign_up(app, "ada@example.com").await;

    let reply = send(
        app,
        "POST",
        "/api/generate-qr",
        Some(&token),
        Some(json!({
            "name": "Ada Lovelace",
            "profileImage": png_data_url(300, 300),
            "companyLogo": png_data_url(240, 120),
        })),
    )
    .await;

    assert_eq!(reply.status, 200);
    let body = reply.json();
    assert_eq!(body["tier"], "simple");
    assert_eq!(
        body["profileUrl"],
        format!("http://localhost:3000/contact/{id}")
    );
    assert!(body["qrCode"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    let reply = send(app, "GET", &format!("/api/contact/{id}"), None, None).await;
    let stored = reply.json();
    assert!(stored["profileImage"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_contact_form_validation() {
    let app = app().await;
    let (_, token) = sign_up(app, "ada@example.com").await;

    let cases = [
        (json!({ "phone": "123" }), "Name is required"),
        (
            json!({ "name": "Ada", "email": "mallory@example.com" }),
            "Email must match the signed-in account",
        ),
        (
            json!({ "name": "Ada", "profileImage": "https://example.com/me.png" }),
            "Invalid profile image format",
        ),
    ];

    for (body, message) in cases {
        let reply = send(app, "POST", "/api/profile/update", Some(&token), Some(body)).await;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.json()["error"], message);
    }

    let reply = send(
        app,
        "POST",
        "/api/generate-qr",
        Some(&token),
        Some(json!({ "name": "Ada", "profileImage": "data:image/png;base64,AAAA" })),
    )
    .await;
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn test_rejected_images_are_never_stored() {
    let app = app().await;
    let (_, token) = sign_up(app, "ada@example.com").await;
    let corrupt = "data:image/png;base64,AAAA";

    let reply = send(
        app,
        "POST",
        "/api/generate-qr",
        Some(&token),
        Some(json!({ "name": "Ada", "profileImage": corrupt })),
    )
    .await;
    assert_eq!(reply.status, 400);
    let reply = send(app, "GET", "/api/profile", Some(&token), None).await;
    assert_eq!(reply.status, 404);

    let reply = send(
        app,
        "POST",
        "/api/profile/update",
        Some(&token),
        Some(json!({ "name": "Ada Lovelace" })),
    )
    .await;
    assert_eq!(reply.status, 200);

    let oversized = format!(
        "data:image/png;base64,{}",
        STANDARD.encode(vec![0u8; MAX_UPLOAD_BYTES + 1])
    );
    for image in [corrupt.to_string(), oversized] {
        for path in ["/api/profile/update", "/api/generate-qr"] {
            let reply = send(
                app,
                "POST",
                path,
                Some(&token),
                Some(json!({ "name": "Mallory", "companyLogo": image })),
            )
            .await;
            assert_eq!(reply.status, 400, "{path}");
        }
    }

    let stored = send(app, "GET", "/api/profile", Some(&token), None)
        .await
        .json();
    assert_eq!(stored["name"], "Ada Lovelace");
    assert!(stored.get("companyLogo").map_or(true, Value::is_null));
}

#[tokio::test]
async fn test_patch_profile_updates_named_fields() {
    let app = app().await;
    let (_, token) = sign_up(app, "ada@example.com").await;

    let reply = send(
        app,
        "PATCH",
        "/api/profile",
        Some(&token),
        Some(json!({ "phone": "123" })),
    )
    .await;
    assert_eq!(reply.status, 404);

    send(
        app,
        "POST",
        "/api/profile/update",
        Some(&token),
        Some(json!({ "name": "Ada Lovelace", "title": "Countess", "company": "Engines" })),
    )
    .await;

    let reply = send(
        app,
        "PATCH",
        "/api/profile",
        Some(&token),
        Some(json!({ "phone": "+44 20 7946 0000", "title": null, "company": " " })),
    )
    .await;
    assert_eq!(reply.status, 200);
    let patched = reply.json();
    assert_eq!(patched["name"], "Ada Lovelace");
    assert_eq!(patched["phone"], "+44 20 7946 0000");
    assert!(patched.get("title").map_or(true, Value::is_null));
    assert!(patched.get("company").map_or(true, Value::is_null));

    let cases = [
        (json!({ "email": "mallory@example.com" }), "Unknown profile field: email"),
        (json!({ "name": "" }), "Invalid value for name"),
        (json!({ "phone": 42 }), "Invalid value for phone"),
        (
            json!({ "profileImage": "data:image/png;base64,AAAA" }),
            "invalid image: could not decode image",
        ),
    ];
    for (body, message) in cases {
        let reply = send(app, "PATCH", "/api/profile", Some(&token), Some(body)).await;
        assert_eq!(reply.status, 400);
        assert!(
            reply.json()["error"].as_str().unwrap().starts_with(message),
            "{}",
            reply.body
        );
    }

    let reply = send(
        app,
        "PATCH",
        "/api/profile",
        Some(&token),
        Some(json!({ "profileImage": png_data_url(64, 64) })),
    )
    .await;
    assert_eq!(reply.status, 200);

    let stored = send(app, "GET", "/api/profile", Some(&token), None)
        .await
        .json();
    assert_eq!(stored["name"], "Ada Lovelace");
    assert_eq!(stored["phone"], "+44 20 7946 0000");
    assert!(stored["profileImage"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_admin_user_management() {
    let config = Config {
        admin_emails: vec!["root@example.com".to_string()],
        ..Config::default()
    };
    let app = serve(build_router(AppState::with_store(
        config,
        Arc::new(MemoryStore::new()),
    )))
    .await;

    let reply = send(
        app,
        "POST",
        "/api/users",
        None,
        Some(json!({ "email": "grace@example.com", "password": PASSWORD })),
    )
    .await;
    assert_eq!(reply.json()["role"], "user");

    let (root_id, root) = sign_up(app, "Root@Example.com").await;
    let (ada_id, ada) = sign_up(app, "ada@example.com").await;
    send(
        app,
        "POST",
        "/api/profile/update",
        Some(&ada),
        Some(json!({ "name": "Ada Lovelace" })),
    )
    .await;

    let reply = send(app, "GET", "/api/admin/users", None, None).await;
    assert_eq!(reply.status, 401);
    let reply = send(app, "GET", "/api/admin/users", Some(&ada), None).await;
    assert_eq!(reply.status, 403);
    let reply = send(
        app,
        "DELETE",
        &format!("/api/admin/users/{root_id}"),
        Some(&ada),
        None,
    )
    .await;
    assert_eq!(reply.status, 403);

    let reply = send(app, "GET", "/api/admin/users", Some(&root), None).await;
    assert_eq!(reply.status, 200);
    let users = reply.json();
    let users = users.as_array().unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(users[0]["email"], "ada@example.com");
    assert_eq!(users[0]["name"], "Ada Lovelace");
    assert_eq!(users[0]["role"], "user");
    assert_eq!(users[2]["email"], "root@example.com");
    assert_eq!(users[2]["role"], "admin");
    assert!(users[2].get("name").is_none());

    let reply = send(
        app,
        "GET",
        "/api/admin/profiles?email=ADA@example.com",
        Some(&root),
        None,
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["uniqueId"], ada_id);
    let reply = send(
        app,
        "GET",
        "/api/admin/profiles?email=grace@example.com",
        Some(&root),
        None,
    )
    .await;
    assert_eq!(reply.status, 404);

    let uri = format!("/api/admin/users/{ada_id}");
    let reply = send(app, "DELETE", &uri, Some(&root), None).await;
    assert_eq!(reply.status, 204);
    let reply = send(app, "DELETE", &uri, Some(&root), None).await;
    assert_eq!(reply.status, 404);

    let reply = send(app, "GET", "/api/profile", Some(&ada), None).await;
    assert_eq!(reply.status, 401);
    let reply = send(app, "GET", &format!("/api/contact/{ada_id}"), None, None).await;
    assert_eq!(reply.status, 404);
    let reply = send(app, "GET", "/api/admin/users", Some(&root), None).await;
    assert_eq!(reply.json().as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_malformed_json_is_a_bad_request() {
    let reply = send_raw(
        app().await,
        "POST",
        "/api/users",
        None,
        Some("{not json".to_string()),
    )
    .await;

    assert_eq!(reply.status, 400);
    assert!(reply.json()["error"].is_string());
}

#[tokio::test]
async fn test_contact_page_and_vcard_download() {
    let app = app().await;
    let (id, token) = sign_up(app, "ada@example.com").await;
    let (_, other) = sign_up(app, "grace@example.com").await;

    let reply = send(
        app,
        "POST",
        "/api/profile/update",
        Some(&token),
        Some(json!({
            "name": "Ada Lovelace",
            "website": "https://ada.example.com",
            "profileImage": png_data_url(32, 32),
        })),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["uniqueId"], id);

    let uri = format!("/api/contact/{id}");
    let anonymous = send(app, "GET", &uri, None, None).await.json();
    assert_eq!(anonymous["name"], "Ada Lovelace");
    assert_eq!(anonymous["uniqueId"], id);
    assert_eq!(anonymous["isOwner"], false);

    let owner = send(app, "GET", &uri, Some(&token), None).await.json();
    assert_eq!(owner["isOwner"], true);

    let stranger = send(app, "GET", &uri, Some(&other), None).await.json();
    assert_eq!(stranger["isOwner"], false);

    let reply = send(app, "GET", &format!("/contact/{id}/vcard"), None, None).await;
    assert_eq!(reply.status, 200);
    assert!(reply.headers["content-type"].starts_with("text/vcard"));
    let card = reply.body;
    assert!(card.starts_with("BEGIN:VCARD\nVERSION:3.0\n"));
    assert!(card.contains("FN:Ada Lovelace"));
    assert!(card.contains("URL:https://ada.example.com"));
    assert!(!card.contains("PHOTO"));

    let missing = send(app, "GET", "/api/contact/nope", None, None).await;
    assert_eq!(missing.status, 404);
    let missing = send(app, "GET", "/contact/nope/vcard", None, None).await;
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_signout_ends_session() {
    let app = app().await;
    let (_, token) = sign_up(app, "ada@example.com").await;

    let reply = send(app, "POST", "/api/auth/signout", Some(&token), None).await;
    assert_eq!(reply.status, 204);

    let reply = send(app, "GET", "/api/profile", Some(&token), None).await;
    assert_eq!(reply.status, 401);
}

#[tokio::test]
async fn test_password_change() {
    let app = app().await;
    let (_, token) = sign_up(app, "ada@example.com").await;
    let new_password = "a much longer secret";

    let reply = send(
        app,
        "POST",
        "/api/users/password",
        Some(&token),
        Some(json!({ "currentPassword": "wrong password", "newPassword": new_password })),
    )
    .await;
    assert_eq!(reply.status, 401);

    let reply = send(
        app,
        "POST",
        "/api/users/password",
        Some(&token),
        Some(json!({ "currentPassword": PASSWORD, "newPassword": new_password })),
    )
    .await;
    assert_eq!(reply.status, 204);

    let reply = send(app, "GET", "/api/profile", Some(&token), None).await;
    assert_eq!(reply.status, 401);

    let old = send(
        app,
        "POST",
        "/api/auth/signin",
        None,
        Some(json!({ "email": "ada@example.com", "password": PASSWORD })),
    )
    .await;
    assert_eq!(old.status, 401);

    let new = send(
        app,
        "POST",
        "/api/auth/signin",
        None,
        Some(json!({ "email": "ada@example.com", "password": new_password })),
    )
    .await;
    assert_eq!(new.status, 200);
}
