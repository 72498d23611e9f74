use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    apply_updates, validate_updates, Account, AccountId, ContactStore, FieldUpdate, Role,
    StoreError, StoreResult,
};
use crate::vcard::ContactProfile;

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    profiles: HashMap<AccountId, ContactProfile>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn find_account_by_id(&self, id: &AccountId) -> StoreResult<Option<Account>> {
        Ok(self.tables.read().await.accounts.get(id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.values().find(|a| a.email == email).cloned())
    }

    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> StoreResult<Account> {
        let mut tables = self.tables.write().await;
        if tables.accounts.values().any(|a| a.email == email) {
            return Err(StoreError::Conflict(format!("email {email} already registered")));
        }

        let account = Account {
            id: AccountId::generate(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role,
        };
        tables.accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<Account> = tables.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(accounts)
    }

    async fn delete_account(&self, id: &AccountId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.accounts.remove(id).ok_or(StoreError::NotFound)?;
        tables.profiles.remove(id);
        Ok(())
    }

    async fn set_password_hash(&self, id: &AccountId, password_hash: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let account = tables.accounts.get_mut(id).ok_or(StoreError::NotFound)?;
        account.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn find_profile(&self, id: &AccountId) -> StoreResult<Option<ContactProfile>> {
        Ok(self.tables.read().await.profiles.get(id).cloned())
    }

    async fn find_profile_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<(AccountId, ContactProfile)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .profiles
            .iter()
            .find(|(_, p)| p.email == email)
            .map(|(id, p)| (id.clone(), p.clone())))
    }

    async fn save_profile(&self, id: &AccountId, profile: &ContactProfile) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.accounts.contains_key(id) {
            return Err(StoreError::NotFound);
        }
        let taken = tables
            .profiles
            .iter()
            .any(|(owner, p)| owner != id && p.email == profile.email);
        if taken {
            return Err(StoreError::Conflict(format!(
                "email {} used by another profile",
                profile.email
            )));
        }

        tables.profiles.insert(id.clone(), profile.clone());
        Ok(())
    }

    async fn update_fields(
        &self,
        id: &AccountId,
        updates: &[FieldUpdate],
    ) -> StoreResult<ContactProfile> {
        validate_updates(updates)?;

        let mut tables = self.tables.write().await;
        let profile = tables.profiles.get_mut(id).ok_or(StoreError::NotFound)?;
        apply_updates(profile, updates);
        Ok(profile.clone())
    }
}
