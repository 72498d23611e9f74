use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::JsonRejection, FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::{
    auth::{hash_password, normalize_email, verify_password, Session},
    card::{self, profile_url, CardError, CardImages, PayloadTier},
    error::AppError,
    qr,
    state::AppState,
    store::{AccountId, FieldUpdate, ProfileField, Role, StoreError},
    vcard::{self, ContactProfile},
};

/// `Json` whose rejections use the crate's error body.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::Validation(e.body_text()))?;
        Ok(Self(value))
    }
}

/// A signed-in caller, resolved from an `Authorization: Bearer <token>` header.
pub struct AuthSession {
    pub session: Session,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AppError::Unauthorized)?
            .to_string();

        let session = state
            .sessions
            .resolve(&token)
            .await
            .ok_or(AppError::Unauthorized)?;

        Ok(Self { session, token })
    }
}

/// A signed-in caller holding the admin role.
pub struct AdminSession(pub Session);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthSession::from_request_parts(parts, state).await?;
        if auth.session.role != Role::Admin {
            return Err(AppError::Forbidden);
        }
        Ok(Self(auth.session))
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    email: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn required(self) -> Result<(String, String), AppError> {
        match (self.email, self.password) {
            (Some(email), Some(password)) if !email.trim().is_empty() && !password.is_empty() => {
                Ok((normalize_email(&email), password))
            }
            _ => Err(AppError::Validation("Email and password are required".to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    current_password: String,
    new_password: String,
}

/// Contact data as submitted by the profile form.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContactForm {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    title: Option<String>,
    website: Option<String>,
    profile_image: Option<String>,
    company_logo: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn image_label(field: ProfileField) -> Option<&'static str> {
    match field {
        ProfileField::ProfileImage => Some("profile image"),
        ProfileField::CompanyLogo => Some("company logo"),
        _ => None,
    }
}

fn image_field(value: Option<String>, label: &str) -> Result<Option<String>, AppError> {
    match non_blank(value) {
        Some(url) if !url.starts_with("data:image/") => {
            Err(AppError::Validation(format!("Invalid {label} format")))
        }
        other => Ok(other),
    }
}

impl ContactForm {
    /// Validates the form and binds it to the caller's account email.
    fn into_profile(self, session: &Session) -> Result<ContactProfile, AppError> {
        let display_name = non_blank(self.name)
            .ok_or_else(|| AppError::Validation("Name is required".to_string()))?;

        if let Some(email) = non_blank(self.email) {
            if normalize_email(&email) != session.email {
                return Err(AppError::Validation(
                    "Email must match the signed-in account".to_string(),
                ));
            }
        }

        Ok(ContactProfile {
            display_name,
            email: session.email.clone(),
            phone: non_blank(self.phone),
            company: non_blank(self.company),
            title: non_blank(self.title),
            website: non_blank(self.website),
            profile_image: image_field(self.profile_image, "profile image")?,
            company_logo: image_field(self.company_logo, "company logo")?,
        })
    }
}

/// Turns a partial edit such as `{"phone": "+44 20", "title": null}` into field updates.
/// Keys must name a [`ProfileField`]; `null` or a blank string clears the field.
fn field_updates(body: Map<String, Value>) -> Result<Vec<FieldUpdate>, AppError> {
    body.into_iter()
        .map(|(key, value)| {
            let field: ProfileField = key.parse()?;
            let value = match value {
                Value::Null => None,
                Value::String(text) => non_blank(Some(text)),
                _ => return Err(AppError::Validation(format!("Invalid value for {key}"))),
            };
            let value = match image_label(field) {
                Some(label) => image_field(value, label)?,
                None => value,
            };
            Ok(FieldUpdate { field, value })
        })
        .collect()
}

/// Reduces the profile's images off the async runtime so bad uploads are rejected before
/// anything is stored.
async fn reduce_images(profile: ContactProfile) -> Result<(ContactProfile, CardImages), AppError> {
    let reduced = tokio::task::spawn_blocking(move || {
        CardImages::reduce(&profile).map(|images| (profile, images))
    })
    .await??;
    Ok(reduced)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountView {
    unique_id: AccountId,
    email: String,
    role: Role,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserView {
    unique_id: AccountId,
    email: String,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Deserialize)]
pub struct EmailQuery {
    email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInView {
    token: String,
    unique_id: AccountId,
    email: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedView {
    qr_code: String,
    tier: PayloadTier,
    profile_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactView {
    unique_id: AccountId,
    #[serde(flatten)]
    profile: ContactProfile,
    is_owner: bool,
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(credentials): JsonBody<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let (email, password) = credentials.required()?;
    if !email.contains('@') {
        return Err(AppError::Validation("Invalid email address".to_string()));
    }

    let role = if state.config.is_admin_email(&email) {
        Role::Admin
    } else {
        Role::User
    };
    let password_hash = hash_password(&password)?;
    let account = state
        .store
        .create_account(&email, &password_hash, role)
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => AppError::Conflict("Email already registered".to_string()),
            other => other.into(),
        })?;

    info!("Registered {} account {}", account.role.as_str(), account.id);
    Ok((
        StatusCode::CREATED,
        Json(AccountView {
            unique_id: account.id,
            email: account.email,
            role: account.role,
        }),
    ))
}

pub async fn signin_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(credentials): JsonBody<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let (email, password) = credentials.required()?;

    let account = state
        .store
        .find_account_by_email(&email)
        .await?
        .filter(|account| verify_password(&password, &account.password_hash))
        .ok_or(AppError::InvalidCredentials)?;

    let token = state.sessions.issue(&account).await;
    info!("Account {} signed in", account.id);

    Ok(Json(SignInView {
        token,
        unique_id: account.id,
        email: account.email,
    }))
}

pub async fn signout_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
) -> impl IntoResponse {
    state.sessions.revoke(&auth.token).await;
    StatusCode::NO_CONTENT
}

/// Changes the caller's password and ends all of the account's sessions.
pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
    JsonBody(change): JsonBody<PasswordChange>,
) -> Result<impl IntoResponse, AppError> {
    let id = &auth.session.account_id;
    let account = state
        .store
        .find_account_by_id(id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !verify_password(&change.current_password, &account.password_hash) {
        return Err(AppError::InvalidCredentials);
    }

    let password_hash = hash_password(&change.new_password)?;
    state.store.set_password_hash(id, &password_hash).await?;
    state.sessions.revoke_account(id).await;

    info!("Password changed for account {id}");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
) -> Result<impl IntoResponse, AppError> {
    let profile = state
        .store
        .find_profile(&auth.session.account_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(profile))
}

pub async fn update_profile_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
    JsonBody(form): JsonBody<ContactForm>,
) -> Result<impl IntoResponse, AppError> {
    let id = auth.session.account_id.clone();
    let (profile, _) = reduce_images(form.into_profile(&auth.session)?).await?;

    state.store.save_profile(&id, &profile).await?;
    info!("Saved profile for account {id}");

    Ok(Json(json!({ "uniqueId": id })))
}

/// Applies a partial edit to the caller's existing profile and returns the result.
pub async fn patch_profile_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
    JsonBody(body): JsonBody<Map<String, Value>>,
) -> Result<impl IntoResponse, AppError> {
    let id = &auth.session.account_id;
    let updates = field_updates(body)?;

    let images: Vec<String> = updates
        .iter()
        .filter(|u| image_label(u.field).is_some())
        .filter_map(|u| u.value.clone())
        .collect();
    if !images.is_empty() {
        tokio::task::spawn_blocking(move || {
            images
                .iter()
                .try_for_each(|url| card::reduce_optional(Some(url.as_str())).map(drop))
                .map_err(CardError::from)
        })
        .await??;
    }

    let profile = state.store.update_fields(id, &updates).await?;
    debug!(fields = updates.len(), "Patched profile for account {id}");

    Ok(Json(profile))
}

/// Reduces the submitted images, saves the card, then encodes it as a QR code.
pub async fn generate_qr_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthSession,
    JsonBody(form): JsonBody<ContactForm>,
) -> Result<impl IntoResponse, AppError> {
    let id = auth.session.account_id.clone();
    let (profile, images) = reduce_images(form.into_profile(&auth.session)?).await?;
    state.store.save_profile(&id, &profile).await?;

    let url = profile_url(&state.config.base_url, &id);
    let renderer = state.renderer.clone();
    let ecc = state.config.qr_ecc;
    let options = state.config.render;
    let link = url.clone();

    let (tier, qr_code) = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
        let generated =
            card::generate_with_images(renderer.as_ref(), ecc, &profile, &images, &link)?;
        debug!(
            tier = ?generated.tier,
            len = generated.vcard.len(),
            version = generated.qr.version(),
            "Encoded contact card"
        );
        Ok((generated.tier, qr::render_data_url(&generated.qr, &options)?))
    })
    .await??;

    info!("Generated {tier:?} QR code for account {id}");
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(GeneratedView {
            qr_code,
            tier,
            profile_url: url,
        }),
    ))
}

/// Public contact page data. `isOwner` is set when the caller owns the card.
pub async fn contact_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    auth: Option<AuthSession>,
) -> Result<impl IntoResponse, AppError> {
    let id = AccountId::from(id);
    let profile = state
        .store
        .find_profile(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    let is_owner = auth.is_some_and(|a| a.session.account_id == id);

    Ok(Json(ContactView {
        unique_id: id,
        profile,
        is_owner,
    }))
}

/// Text-only vCard for importing into an address book.
pub async fn contact_vcard_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let profile = state
        .store
        .find_profile(&AccountId::from(id))
        .await?
        .ok_or(AppError::NotFound)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/vcard; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"contact.vcf\""),
        ],
        vcard::assemble(&profile, None, None),
    ))
}

/// Every account with its role and card name, for the admin console.
pub async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    AdminSession(_): AdminSession,
) -> Result<impl IntoResponse, AppError> {
    let accounts = state.store.list_accounts().await?;

    let mut users = Vec::with_capacity(accounts.len());
    for account in accounts {
        let name = state
            .store
            .find_profile(&account.id)
            .await?
            .map(|p| p.display_name);
        users.push(UserView {
            unique_id: account.id,
            email: account.email,
            role: account.role,
            name,
        });
    }

    Ok(Json(users))
}

/// Looks up a card by the owner's email.
pub async fn find_profile_handler(
    State(state): State<Arc<AppState>>,
    AdminSession(session): AdminSession,
    Query(query): Query<EmailQuery>,
) -> Result<impl IntoResponse, AppError> {
    let (id, profile) = state
        .store
        .find_profile_by_email(&normalize_email(&query.email))
        .await?
        .ok_or(AppError::NotFound)?;
    let is_owner = session.account_id == id;

    Ok(Json(ContactView {
        unique_id: id,
        profile,
        is_owner,
    }))
}

/// Removes an account and its card, and ends its sessions.
pub async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    AdminSession(session): AdminSession,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = AccountId::from(id);
    state.store.delete_account(&id).await?;
    state.sessions.revoke_account(&id).await;

    info!("Account {id} removed by {}", session.account_id);
    Ok(StatusCode::NO_CONTENT)
}
