use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{
    validate_updates, Account, AccountId, ContactStore, FieldUpdate, Role, StoreError,
    StoreResult,
};
use crate::vcard::ContactProfile;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id            TEXT PRIMARY KEY NOT NULL,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role          TEXT NOT NULL DEFAULT 'user'
);
CREATE TABLE IF NOT EXISTS contact_profiles (
    account_id    TEXT PRIMARY KEY NOT NULL REFERENCES accounts(id),
    display_name  TEXT NOT NULL,
    email         TEXT NOT NULL UNIQUE,
    phone         TEXT,
    company       TEXT,
    title         TEXT,
    website       TEXT,
    profile_image TEXT,
    company_logo  TEXT
);
";

const ACCOUNT_COLUMNS: &str = "id, email, password_hash, role";

const PROFILE_COLUMNS: &str =
    "display_name, email, phone, company, title, website, profile_image, company_logo";

/// SQLite-backed store.
///
/// Holds only the database path. Every operation opens its own connection on a blocking
/// thread and drops it before returning, whatever the outcome.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> StoreResult<()> {
        debug!("Applying schema to {}", self.path.display());
        self.with_connection(|conn| Ok(conn.execute_batch(SCHEMA)?))
            .await
    }

    async fn with_connection<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn connect(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let role: String = row.get(3)?;
    Ok(Account {
        id: AccountId::from(row.get::<_, String>(0)?),
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role: role.parse().map_err(|e: StoreError| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

/// Reads the columns listed in [`PROFILE_COLUMNS`], starting at `offset`.
fn profile_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ContactProfile> {
    Ok(ContactProfile {
        display_name: row.get(offset)?,
        email: row.get(offset + 1)?,
        phone: row.get(offset + 2)?,
        company: row.get(offset + 3)?,
        title: row.get(offset + 4)?,
        website: row.get(offset + 5)?,
        profile_image: row.get(offset + 6)?,
        company_logo: row.get(offset + 7)?,
    })
}

fn select_profile(conn: &Connection, id: &str) -> StoreResult<Option<ContactProfile>> {
    let sql = format!("SELECT {PROFILE_COLUMNS} FROM contact_profiles WHERE account_id = ?1");
    Ok(conn
        .query_row(&sql, [id], |row| profile_from_row(row, 0))
        .optional()?)
}

#[async_trait]
impl ContactStore for SqliteStore {
    async fn find_account_by_id(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                    [id],
                    account_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let email = email.to_string();
        self.with_connection(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1"),
                    [email],
                    account_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> StoreResult<Account> {
        let account = Account {
            id: AccountId::generate(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role,
        };
        self.with_connection(move |conn| {
            conn.execute(
                &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4)"),
                params![
                    account.id.as_str(),
                    account.email,
                    account.password_hash,
                    account.role.as_str()
                ],
            )?;
            Ok(account)
        })
        .await
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY email"))?;
            let accounts = stmt
                .query_map([], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn delete_account(&self, id: &AccountId) -> StoreResult<()> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM contact_profiles WHERE account_id = ?1", [&id])?;
            if tx.execute("DELETE FROM accounts WHERE id = ?1", [&id])? == 0 {
                return Err(StoreError::NotFound);
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_password_hash(&self, id: &AccountId, password_hash: &str) -> StoreResult<()> {
        let id = id.to_string();
        let password_hash = password_hash.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn find_profile(&self, id: &AccountId) -> StoreResult<Option<ContactProfile>> {
        let id = id.to_string();
        self.with_connection(move |conn| select_profile(conn, &id))
            .await
    }

    async fn find_profile_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<(AccountId, ContactProfile)>> {
        let email = email.to_string();
        self.with_connection(move |conn| {
            let sql =
                format!("SELECT account_id, {PROFILE_COLUMNS} FROM contact_profiles WHERE email = ?1");
            Ok(conn
                .query_row(&sql, [email], |row| {
                    Ok((
                        AccountId::from(row.get::<_, String>(0)?),
                        profile_from_row(row, 1)?,
                    ))
                })
                .optional()?)
        })
        .await
    }

    async fn save_profile(&self, id: &AccountId, profile: &ContactProfile) -> StoreResult<()> {
        let id = id.to_string();
        let p = profile.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row("SELECT 1 FROM accounts WHERE id = ?1", [&id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(StoreError::NotFound);
            }

            tx.execute(
                &format!(
                    "INSERT INTO contact_profiles (account_id, {PROFILE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(account_id) DO UPDATE SET
                         display_name = excluded.display_name,
                         email = excluded.email,
                         phone = excluded.phone,
                         company = excluded.company,
                         title = excluded.title,
                         website = excluded.website,
                         profile_image = excluded.profile_image,
                         company_logo = excluded.company_logo"
                ),
                params![
                    id,
                    p.display_name,
                    p.email,
                    p.phone,
                    p.company,
                    p.title,
                    p.website,
                    p.profile_image,
                    p.company_logo
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_fields(
        &self,
        id: &AccountId,
        updates: &[FieldUpdate],
    ) -> StoreResult<ContactProfile> {
        validate_updates(updates)?;

        let id = id.to_string();
        let updates = updates.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            if !updates.is_empty() {
                let assignments: Vec<String> = updates
                    .iter()
                    .enumerate()
                    .map(|(i, u)| format!("{} = ?{}", u.field.column(), i + 1))
                    .collect();
                let sql = format!(
                    "UPDATE contact_profiles SET {} WHERE account_id = ?{}",
                    assignments.join(", "),
                    updates.len() + 1
                );
                let values = updates
                    .iter()
                    .map(|u| u.value.clone())
                    .chain(std::iter::once(Some(id.clone())));

                if tx.execute(&sql, params_from_iter(values))? == 0 {
                    return Err(StoreError::NotFound);
                }
            }

            let profile = select_profile(&tx, &id)?.ok_or(StoreError::NotFound)?;
            tx.commit()?;
            Ok(profile)
        })
        .await
    }
}
