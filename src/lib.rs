//! # qircard
//!
//! A digital business card service. Users register, fill in a contact card and get back a QR
//! code that carries the whole card as a vCard, photo and company logo included.
//!
//! Embedded images are shrunk to thumbnails before encoding. When the resulting vCard still
//! does not fit in a QR symbol, the service falls back to a text-only card that links to the
//! hosted contact page.
//!
//! ## Modules
//!
//! - [`vcard`]: vCard 3.0 assembly and parsing.
//! - [`reduce`]: image thumbnailing under a byte ceiling.
//! - [`qr`]: QR encoding and PNG/SVG rendering.
//! - [`card`]: the full/simple payload fallback.
//! - [`store`]: account and profile persistence, in memory or SQLite.
//! - [`auth`]: password hashing, bearer sessions and roles.
//! - [`routes`]: the HTTP API.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=qircard=info QIRCARD_DATABASE=cards.sqlite3 qircard
//! ```
//!
//! ## Example
//!
//! ```rust
//! use qircard::{card, qr::{ErrorCorrection, StandardRenderer}, vcard::ContactProfile};
//!
//! let profile = ContactProfile::new("Ada Lovelace", "ada@example.com");
//! let generated = card::generate(
//!     &StandardRenderer,
//!     ErrorCorrection::Quartile,
//!     &profile,
//!     "https://cards.example.com/contact/abc",
//! )
//! .unwrap();
//!
//! assert_eq!(generated.tier, card::PayloadTier::Full);
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{delete, get, post},
    Router,
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

pub mod auth;
pub mod card;
pub mod config;
pub mod error;
pub mod qr;
pub mod reduce;
pub mod routes;
pub mod state;
pub mod store;
pub mod vcard;

use config::Config;
use error::StartupError;
use routes::{
    change_password_handler, contact_handler, contact_vcard_handler, delete_user_handler,
    find_profile_handler, generate_qr_handler, get_profile_handler, health_handler,
    list_users_handler, patch_profile_handler, register_handler, signin_handler,
    signout_handler, update_profile_handler,
};
use state::AppState;

/// Request bodies carry two base64 images of up to 5 MiB each.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/users", post(register_handler))
        .route("/api/users/password", post(change_password_handler))
        .route("/api/auth/signin", post(signin_handler))
        .route("/api/auth/signout", post(signout_handler))
        .route(
            "/api/profile",
            get(get_profile_handler).patch(patch_profile_handler),
        )
        .route("/api/profile/update", post(update_profile_handler))
        .route("/api/generate-qr", post(generate_qr_handler))
        .route("/api/contact/:id", get(contact_handler))
        .route("/contact/:id/vcard", get(contact_vcard_handler))
        .route("/api/admin/users", get(list_users_handler))
        .route("/api/admin/users/:id", delete(delete_user_handler))
        .route("/api/admin/profiles", get(find_profile_handler))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> Result<(), StartupError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}, QR ecc {}", state.config.qr_ecc);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
