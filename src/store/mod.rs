//! # Contact storage
//!
//! Two record kinds, linked one-to-one:
//!
//! - **Account**: unique id, unique email, argon2 password hash, role
//! - **ContactProfile**: the business card owned by that account
//!
//! A profile is created on the first save and updated in place after that. There is no
//! optimistic concurrency control: two saves racing on the same account both succeed and the
//! last one to commit wins.
//!
//! Partial updates only ever touch the columns named by [`ProfileField`], so field names coming
//! from clients are checked against a fixed schema before any query is built.
use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vcard::ContactProfile;

#[cfg(test)]
mod contract;
mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Unknown profile field: {0}")]
    UnknownField(String),

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(msg.unwrap_or_else(|| err.to_string()))
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Stable account identifier, a UUID v4 string.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an account may do. Every account can manage its own card; admins can also list and
/// remove accounts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(StoreError::Backend(format!("unknown role {s:?}"))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

/// A profile field that may be updated on its own.
///
/// The email is not listed: it belongs to the account.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ProfileField {
    Name,
    Phone,
    Company,
    Title,
    Website,
    ProfileImage,
    CompanyLogo,
}

impl ProfileField {
    pub const ALL: [ProfileField; 7] = [
        ProfileField::Name,
        ProfileField::Phone,
        ProfileField::Company,
        ProfileField::Title,
        ProfileField::Website,
        ProfileField::ProfileImage,
        ProfileField::CompanyLogo,
    ];

    /// Storage column backing this field.
    pub fn column(self) -> &'static str {
        use ProfileField::*;
        match self {
            Name => "display_name",
            Phone => "phone",
            Company => "company",
            Title => "title",
            Website => "website",
            ProfileImage => "profile_image",
            CompanyLogo => "company_logo",
        }
    }

    /// Name used in JSON payloads.
    pub fn key(self) -> &'static str {
        use ProfileField::*;
        match self {
            Name => "name",
            Phone => "phone",
            Company => "company",
            Title => "title",
            Website => "website",
            ProfileImage => "profileImage",
            CompanyLogo => "companyLogo",
        }
    }

    pub fn get(self, profile: &ContactProfile) -> Option<&str> {
        use ProfileField::*;
        match self {
            Name => Some(profile.display_name.as_str()),
            Phone => profile.phone.as_deref(),
            Company => profile.company.as_deref(),
            Title => profile.title.as_deref(),
            Website => profile.website.as_deref(),
            ProfileImage => profile.profile_image.as_deref(),
            CompanyLogo => profile.company_logo.as_deref(),
        }
    }

    fn apply(self, profile: &mut ContactProfile, value: Option<String>) {
        use ProfileField::*;
        match self {
            Name => profile.display_name = value.unwrap_or_default(),
            Phone => profile.phone = value,
            Company => profile.company = value,
            Title => profile.title = value,
            Website => profile.website = value,
            ProfileImage => profile.profile_image = value,
            CompanyLogo => profile.company_logo = value,
        }
    }
}

impl FromStr for ProfileField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProfileField::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| StoreError::UnknownField(s.to_string()))
    }
}

/// New value for one field; `None` clears it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldUpdate {
    pub field: ProfileField,
    pub value: Option<String>,
}

impl FieldUpdate {
    pub fn set(field: ProfileField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: Some(value.into()),
        }
    }

    pub fn clear(field: ProfileField) -> Self {
        Self { field, value: None }
    }
}

/// The display name may never be cleared or blanked.
fn validate_updates(updates: &[FieldUpdate]) -> StoreResult<()> {
    let blank_name = updates.iter().any(|u| {
        u.field == ProfileField::Name && u.value.as_deref().map_or(true, |v| v.trim().is_empty())
    });
    if blank_name {
        return Err(StoreError::InvalidValue("name"));
    }
    Ok(())
}

fn apply_updates(profile: &mut ContactProfile, updates: &[FieldUpdate]) {
    for update in updates {
        update.field.apply(profile, update.value.clone());
    }
}

/// Persistence for accounts and their contact profiles.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn find_account_by_id(&self, id: &AccountId) -> StoreResult<Option<Account>>;

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Creates an account with a fresh id. Fails with [`StoreError::Conflict`] if the email is
    /// already registered.
    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> StoreResult<Account>;

    /// Every account, ordered by email.
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Removes the account together with its profile.
    async fn delete_account(&self, id: &AccountId) -> StoreResult<()>;

    async fn set_password_hash(&self, id: &AccountId, password_hash: &str) -> StoreResult<()>;

    async fn find_profile(&self, id: &AccountId) -> StoreResult<Option<ContactProfile>>;

    async fn find_profile_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<(AccountId, ContactProfile)>>;

    /// Creates the profile on first save and replaces every field after that.
    async fn save_profile(&self, id: &AccountId, profile: &ContactProfile) -> StoreResult<()>;

    /// Updates only the named fields and returns the resulting profile.
    async fn update_fields(
        &self,
        id: &AccountId,
        updates: &[FieldUpdate],
    ) -> StoreResult<ContactProfile>;
}
