mod common;

use keyward::errors::{LicenseError, LicenseResult};
use keyward::store::{LicenseColumn, Query};
use keyward::{
    ImportReport, IssueOptions, LicenseDraft, LicenseSource, LicenseStatus, LicenseUpdate,
};

use common::{setup_in_memory_db, setup_service, test_codec};

// =============================================================================
// Create / Find Tests
// =============================================================================

#[tokio::test]
async fn create_stores_ciphertext_and_digest() -> LicenseResult<()> {
    let (db, service) = setup_service().await?;

    let license = service
        .create(
            LicenseDraft::new("ABCD-1234", LicenseStatus::Sold)
                .order_id(10)
                .product_id(20),
        )
        .await?;

    assert!(license.id > 0);
    assert_eq!(license.status, LicenseStatus::Sold);
    assert_eq!(license.source, LicenseSource::Api);
    assert_eq!(license.order_id, Some(10));
    assert_eq!(license.product_id, Some(20));
    assert_ne!(license.key_encrypted, "ABCD-1234", "plaintext must not be stored");
    assert_eq!(license.key_hash, test_codec().hash("ABCD-1234"));
    assert_eq!(service.decrypt_key(&license)?, "ABCD-1234");

    // No row holds the plaintext in either key column
    let by_plaintext = db
        .count_licenses(&Query::new().eq(LicenseColumn::Hash, "ABCD-1234"))
        .await?;
    assert_eq!(by_plaintext, 0);

    Ok(())
}

#[tokio::test]
async fn create_records_actor() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;
    let service = service.with_actor(42);

    let license = service
        .create(LicenseDraft::new("ACTOR-1", LicenseStatus::Active))
        .await?;
    assert_eq!(license.created_by, Some(42));
    assert!(license.updated_at.is_none());

    Ok(())
}

#[tokio::test]
async fn find_by_key_uses_digest() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let created = service
        .create(LicenseDraft::new("FIND-ME", LicenseStatus::Delivered))
        .await?;

    let found = service.find_by_key("FIND-ME").await?;
    assert_eq!(found.as_ref().map(|l| l.id), Some(created.id));

    assert!(service.find_by_key("find-me").await?.is_none());
    assert!(service.find_by_key("NOPE").await?.is_none());

    Ok(())
}

#[tokio::test]
async fn create_rejects_duplicate_key() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("DUP-KEY", LicenseStatus::Sold))
        .await?;
    let result = service
        .create(LicenseDraft::new("DUP-KEY", LicenseStatus::Active))
        .await;

    assert!(matches!(result, Err(LicenseError::DuplicateLicenseError)));
    assert_eq!(service.count(&Query::new()).await?, 1);

    Ok(())
}

#[tokio::test]
async fn create_over_ceiling_writes_nothing() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let result = service
        .create(
            LicenseDraft::new("XYZ-1", LicenseStatus::Active)
                .times_activated(5)
                .times_activated_max(3),
        )
        .await;

    assert!(matches!(
        result,
        Err(LicenseError::ActivationCeilingExceededError {
            times_activated: 5,
            times_activated_max: 3
        })
    ));
    assert_eq!(service.count(&Query::new()).await?, 0);

    Ok(())
}

#[tokio::test]
async fn create_rejects_bad_expiry() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let result = service
        .create(LicenseDraft::new("DATE-1", LicenseStatus::Sold).expires_at("next tuesday"))
        .await;

    assert!(matches!(result, Err(LicenseError::InvalidDateError(_))));
    assert_eq!(service.count(&Query::new()).await?, 0);

    Ok(())
}

#[tokio::test]
async fn create_parses_expiry_and_valid_for() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let explicit = service
        .create(LicenseDraft::new("EXP-1", LicenseStatus::Sold).expires_at("2030-06-30"))
        .await?;
    assert_eq!(
        explicit.expires_at.map(|d| d.to_string()),
        Some("2030-06-30 23:59:59".to_string())
    );

    let relative = service
        .create(LicenseDraft::new("EXP-2", LicenseStatus::Sold).valid_for(30))
        .await?;
    assert_eq!(relative.valid_for, Some(30));
    let expires_at = relative.expires_at.expect("valid_for sets an expiry");
    let days = (expires_at - relative.created_at).num_days();
    assert!((29..=30).contains(&days), "expected ~30 days, got {days}");

    Ok(())
}

#[tokio::test]
async fn create_rejects_out_of_range_valid_for() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let result = service
        .create(LicenseDraft::new("FAR-FUTURE", LicenseStatus::Sold).valid_for(u32::MAX))
        .await;

    assert!(matches!(result, Err(LicenseError::InvalidDateError(_))));
    assert_eq!(service.count(&Query::new()).await?, 0);

    Ok(())
}

#[tokio::test]
async fn create_rejects_blank_key() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let result = service
        .create(LicenseDraft::new("   ", LicenseStatus::Sold))
        .await;
    assert!(matches!(result, Err(LicenseError::ValidationError { .. })));

    Ok(())
}

// =============================================================================
// Update Tests
// =============================================================================

#[tokio::test]
async fn update_changes_only_present_fields() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(
            LicenseDraft::new("UPD-1", LicenseStatus::Sold)
                .order_id(1)
                .product_id(2),
        )
        .await?;

    let updated = service
        .update(
            "UPD-1",
            LicenseUpdate::new()
                .status(LicenseStatus::Delivered)
                .order_id(None),
        )
        .await?
        .expect("license exists");

    assert_eq!(updated.status, LicenseStatus::Delivered);
    assert_eq!(updated.order_id, None, "explicit null clears");
    assert_eq!(updated.product_id, Some(2), "absent field is untouched");
    assert!(updated.updated_at.is_some());

    Ok(())
}

#[tokio::test]
async fn update_from_json_patch() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("JSON-1", LicenseStatus::Sold).product_id(5))
        .await?;

    let patch: LicenseUpdate =
        serde_json::from_str(r#"{"status": "ACTIVE", "expires_at": "2031-01-01T00:00:00Z"}"#)
            .expect("valid patch");
    let updated = service.update("JSON-1", patch).await?.expect("license exists");

    assert_eq!(updated.status, LicenseStatus::Active);
    assert_eq!(updated.product_id, Some(5));
    assert_eq!(
        updated.expires_at.map(|d| d.to_string()),
        Some("2031-01-01 00:00:00".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn update_missing_license_returns_none() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let result = service
        .update("GHOST", LicenseUpdate::new().status(LicenseStatus::Used))
        .await?;
    assert!(result.is_none());

    Ok(())
}

#[tokio::test]
async fn update_rekeys_license() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let created = service
        .create(LicenseDraft::new("OLD-KEY", LicenseStatus::Sold))
        .await?;

    let updated = service
        .update("OLD-KEY", LicenseUpdate::new().license_key("NEW-KEY"))
        .await?
        .expect("license exists");

    assert_eq!(updated.id, created.id);
    assert_eq!(service.decrypt_key(&updated)?, "NEW-KEY");
    assert!(service.find_by_key("OLD-KEY").await?.is_none());
    assert_eq!(
        service.find_by_key("NEW-KEY").await?.map(|l| l.id),
        Some(created.id)
    );

    Ok(())
}

#[tokio::test]
async fn update_to_taken_key_leaves_license_unchanged() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    let first = service
        .create(LicenseDraft::new("KEY1", LicenseStatus::Sold))
        .await?;
    service
        .create(LicenseDraft::new("KEY2", LicenseStatus::Sold))
        .await?;

    let result = service
        .update(
            "KEY1",
            LicenseUpdate::new()
                .license_key("KEY2")
                .status(LicenseStatus::Active),
        )
        .await;
    assert!(matches!(result, Err(LicenseError::DuplicateLicenseError)));

    let unchanged = service.find_by_key("KEY1").await?.expect("KEY1 still stored");
    assert_eq!(unchanged, first);

    Ok(())
}

#[tokio::test]
async fn update_to_own_key_is_not_a_duplicate() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("SAME", LicenseStatus::Sold))
        .await?;
    let updated = service
        .update(
            "SAME",
            LicenseUpdate::new()
                .license_key("SAME")
                .status(LicenseStatus::Used),
        )
        .await?
        .expect("license exists");

    assert_eq!(updated.status, LicenseStatus::Used);
    assert_eq!(service.decrypt_key(&updated)?, "SAME");

    Ok(())
}

#[tokio::test]
async fn update_enforces_merged_ceiling() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(
            LicenseDraft::new("CEIL-1", LicenseStatus::Active)
                .times_activated(2)
                .times_activated_max(5),
        )
        .await?;

    let result = service
        .update("CEIL-1", LicenseUpdate::new().times_activated_max(Some(1)))
        .await;
    assert!(matches!(
        result,
        Err(LicenseError::ActivationCeilingExceededError { .. })
    ));

    // Clearing the ceiling makes activations unlimited
    let updated = service
        .update("CEIL-1", LicenseUpdate::new().times_activated_max(None))
        .await?
        .expect("license exists");
    assert_eq!(updated.times_activated_max, None);
    assert_eq!(updated.remaining_activations(), None);

    Ok(())
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn delete_by_key() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("DEL-1", LicenseStatus::Sold))
        .await?;

    assert!(service.delete("DEL-1").await?);
    assert!(service.find_by_key("DEL-1").await?.is_none());
    assert!(!service.delete("DEL-1").await?, "second delete finds nothing");

    Ok(())
}

// =============================================================================
// Activation Tests
// =============================================================================

#[tokio::test]
async fn activate_up_to_ceiling() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(
            LicenseDraft::new("ACT-1", LicenseStatus::Active)
                .times_activated(2)
                .times_activated_max(3),
        )
        .await?;

    let activated = service.activate("ACT-1").await?;
    assert_eq!(activated.times_activated, Some(3));
    assert_eq!(activated.remaining_activations(), Some(0));

    let result = service.activate("ACT-1").await;
    assert!(matches!(
        result,
        Err(LicenseError::ActivationCeilingExceededError {
            times_activated: 3,
            times_activated_max: 3
        })
    ));

    let stored = service.find_by_key("ACT-1").await?.expect("license exists");
    assert_eq!(stored.times_activated, Some(3));

    Ok(())
}

#[tokio::test]
async fn activate_unset_counter_starts_at_zero() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("ACT-2", LicenseStatus::Active))
        .await?;

    assert_eq!(service.activate("ACT-2").await?.times_activated, Some(1));
    assert_eq!(service.activate("ACT-2").await?.times_activated, Some(2));

    Ok(())
}

#[tokio::test]
async fn activate_unknown_key_is_not_found() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    assert!(matches!(
        service.activate("MISSING").await,
        Err(LicenseError::NotFoundError(_))
    ));
    assert!(matches!(
        service.deactivate("MISSING").await,
        Err(LicenseError::NotFoundError(_))
    ));

    Ok(())
}

#[tokio::test]
async fn deactivate_requires_activation() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("DEACT-UNSET", LicenseStatus::Active))
        .await?;
    service
        .create(LicenseDraft::new("DEACT-ZERO", LicenseStatus::Active).times_activated(0))
        .await?;

    assert!(matches!(
        service.deactivate("DEACT-UNSET").await,
        Err(LicenseError::NotActivatedError)
    ));
    assert!(matches!(
        service.deactivate("DEACT-ZERO").await,
        Err(LicenseError::NotActivatedError)
    ));

    Ok(())
}

#[tokio::test]
async fn deactivate_decrements() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("DEACT-1", LicenseStatus::Active).times_activated(1))
        .await?;

    let license = service.deactivate("DEACT-1").await?;
    assert_eq!(license.times_activated, Some(0));
    assert!(matches!(
        service.deactivate("DEACT-1").await,
        Err(LicenseError::NotActivatedError)
    ));

    Ok(())
}

#[tokio::test]
async fn concurrent_activations_never_overshoot() -> LicenseResult<()> {
    let db = setup_in_memory_db().await?;
    let service = keyward::LicenseService::new(db, test_codec()).with_max_write_attempts(20);

    service
        .create(LicenseDraft::new("RACE-1", LicenseStatus::Active).times_activated_max(3))
        .await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move { service.activate("RACE-1").await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => succeeded += 1,
            Err(LicenseError::ActivationCeilingExceededError { .. })
            | Err(LicenseError::ConflictError(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let stored = service.find_by_key("RACE-1").await?.expect("license exists");
    assert_eq!(stored.times_activated, Some(succeeded));
    assert!(succeeded <= 3);

    Ok(())
}

// =============================================================================
// Import Tests
// =============================================================================

#[tokio::test]
async fn import_counts_failures() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    service
        .create(LicenseDraft::new("TAKEN", LicenseStatus::Sold))
        .await?;

    let keys: Vec<String> = ["IMP-1", "IMP-2", "TAKEN", "IMP-1", "  ", " IMP-3 "]
        .iter()
        .map(|k| k.to_string())
        .collect();

    let report: ImportReport = service
        .import_keys(&keys, IssueOptions::new(LicenseStatus::Delivered).product_id(9))
        .await?;

    assert_eq!(report.added, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(report.ids.len(), 3);

    let imported = service.find_by_key("IMP-3").await?.expect("trimmed key stored");
    assert_eq!(imported.source, LicenseSource::Import);
    assert_eq!(imported.status, LicenseStatus::Delivered);
    assert_eq!(imported.product_id, Some(9));

    let count = service
        .count(&Query::new().eq(LicenseColumn::Source, LicenseSource::Import.ordinal()))
        .await?;
    assert_eq!(count, 3);

    Ok(())
}

#[tokio::test]
async fn find_all_filters_by_status() -> LicenseResult<()> {
    let (_db, service) = setup_service().await?;

    for (key, status) in [
        ("S-1", LicenseStatus::Sold),
        ("S-2", LicenseStatus::Sold),
        ("A-1", LicenseStatus::Active),
    ] {
        service.create(LicenseDraft::new(key, status)).await?;
    }

    let sold = service
        .find_all(&Query::new().eq(LicenseColumn::Status, LicenseStatus::Sold.ordinal()))
        .await?;
    assert_eq!(sold.len(), 2);
    assert!(sold.iter().all(|l| l.status == LicenseStatus::Sold));

    let by_id = service.find_by_id(sold[0].id).await?;
    assert_eq!(by_id.as_ref(), Some(&sold[0]));

    Ok(())
}
