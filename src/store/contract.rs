//! Behaviour every [`ContactStore`] backend must share.
use super::{AccountId, ContactStore, FieldUpdate, ProfileField, Role, StoreError};
use crate::vcard::ContactProfile;

pub(crate) async fn check_store(store: &dyn ContactStore) {
    // Accounts
    let ada = store
        .create_account("ada@example.com", "hash-1", Role::User)
        .await
        .unwrap();
    assert_eq!(ada.email, "ada@example.com");
    assert_eq!(ada.role, Role::User);
    assert!(matches!(
        store
            .create_account("ada@example.com", "hash-2", Role::Admin)
            .await,
        Err(StoreError::Conflict(_))
    ));

    let by_id = store.find_account_by_id(&ada.id).await.unwrap().unwrap();
    assert_eq!(by_id, ada);
    let by_email = store
        .find_account_by_email("ada@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_email.id, ada.id);
    assert!(store
        .find_account_by_email("nobody@example.com")
        .await
        .unwrap()
        .is_none());

    store.set_password_hash(&ada.id, "hash-3").await.unwrap();
    let updated = store.find_account_by_id(&ada.id).await.unwrap().unwrap();
    assert_eq!(updated.password_hash, "hash-3");

    let ghost = AccountId::from("no-such-account");
    assert!(matches!(
        store.set_password_hash(&ghost, "x").await,
        Err(StoreError::NotFound)
    ));

    // Profiles
    assert!(store.find_profile(&ada.id).await.unwrap().is_none());
    assert!(matches!(
        store
            .update_fields(&ada.id, &[FieldUpdate::set(ProfileField::Phone, "1")])
            .await,
        Err(StoreError::NotFound)
    ));

    let mut profile = ContactProfile::new("Ada Lovelace", "ada@example.com");
    profile.company = Some("Analytical Engines".to_string());
    store.save_profile(&ada.id, &profile).await.unwrap();
    assert_eq!(
        store.find_profile(&ada.id).await.unwrap(),
        Some(profile.clone())
    );

    profile.title = Some("Countess".to_string());
    profile.company = None;
    store.save_profile(&ada.id, &profile).await.unwrap();
    assert_eq!(
        store.find_profile(&ada.id).await.unwrap(),
        Some(profile.clone())
    );

    let (owner, found) = store
        .find_profile_by_email("ada@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner, ada.id);
    assert_eq!(found, profile);

    let patched = store
        .update_fields(
            &ada.id,
            &[
                FieldUpdate::set(ProfileField::Phone, "+44 20 0000"),
                FieldUpdate::clear(ProfileField::Title),
            ],
        )
        .await
        .unwrap();
    assert_eq!(patched.phone.as_deref(), Some("+44 20 0000"));
    assert_eq!(patched.title, None);
    assert_eq!(patched.display_name, "Ada Lovelace");
    assert_eq!(store.find_profile(&ada.id).await.unwrap(), Some(patched));

    assert!(matches!(
        store
            .update_fields(&ada.id, &[FieldUpdate::clear(ProfileField::Name)])
            .await,
        Err(StoreError::InvalidValue("name"))
    ));

    assert!(matches!(
        store.save_profile(&ghost, &profile).await,
        Err(StoreError::NotFound)
    ));

    // One profile per email
    let grace = store
        .create_account("grace@example.com", "hash", Role::Admin)
        .await
        .unwrap();
    assert!(matches!(
        store
            .save_profile(&grace.id, &ContactProfile::new("Impostor", "ada@example.com"))
            .await,
        Err(StoreError::Conflict(_))
    ));

    // Listing and removal
    let listed = store.list_accounts().await.unwrap();
    let emails: Vec<&str> = listed.iter().map(|a| a.email.as_str()).collect();
    assert_eq!(emails, ["ada@example.com", "grace@example.com"]);
    assert_eq!(listed[1].role, Role::Admin);

    store.delete_account(&ada.id).await.unwrap();
    assert!(store.find_account_by_id(&ada.id).await.unwrap().is_none());
    assert!(store.find_profile(&ada.id).await.unwrap().is_none());
    assert!(store
        .find_profile_by_email("ada@example.com")
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        store.delete_account(&ada.id).await,
        Err(StoreError::NotFound)
    ));

    // The freed email can be registered again
    store
        .create_account("ada@example.com", "hash-4", Role::User)
        .await
        .unwrap();
    assert_eq!(store.list_accounts().await.unwrap().len(), 2);
}
