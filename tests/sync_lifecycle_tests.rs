//! End-to-end staging, application and rollback against an in-memory remote

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use catalog_sync::application::{StageRequest, SyncEngine};
use catalog_sync::domain::{
    ChangeStatus, ChangeType, EntitySnapshot, EntityType, NewApprovalRule, ProductSnapshot,
    RollbackStatus, SyncError,
};
use catalog_sync::infrastructure::memory_monitor::FixedMemorySampler;
use catalog_sync::infrastructure::{AppConfig, DatabaseConnection, InMemoryPlatform};

async fn engine_with_remote() -> Result<(SyncEngine, Arc<InMemoryPlatform>)> {
    let database = DatabaseConnection::in_memory().await?;
    database.migrate().await?;
    let mut config = AppConfig::default();
    config.remote.max_requests_per_second = 1000;
    config.batch.retry_delay_ms = 1;

    let remote = Arc::new(InMemoryPlatform::new());
    let engine = SyncEngine::build(
        config,
        database,
        Arc::clone(&remote),
        Arc::new(FixedMemorySampler::new(128, 16_000)),
    )?;
    Ok((engine, remote))
}

fn lamp(price: f64, description: &str) -> EntitySnapshot {
    EntitySnapshot::Product(ProductSnapshot {
        sku: Some("LAMP-01".into()),
        title: Some("Desk Lamp".into()),
        description: Some(description.into()),
        price: Some(price),
        inventory_quantity: Some(4),
        tags: vec!["lighting".into()],
        ..ProductSnapshot::default()
    })
}

async fn create_lamp(engine: &SyncEngine) -> Result<String> {
    let staging = engine.staging();
    let change = staging
        .stage_change(StageRequest::new(
            EntityType::Product,
            None,
            ChangeType::Create,
            Some(lamp(39.0, "warm white")),
        ))
        .await?;
    staging.approve_change(&change.change_id, "editor", None).await?;
    let applied = staging.apply_change(&change.change_id, "editor").await?;
    Ok(applied.entity_id.unwrap_or_default())
}

#[tokio::test]
async fn apply_then_rollback_restores_original_state() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let entity_id = create_lamp(&engine).await?;
    let staging = engine.staging();

    let update = staging
        .stage_change(StageRequest::new(
            EntityType::Product,
            Some(entity_id.clone()),
            ChangeType::Update,
            Some(lamp(45.0, "cool white")),
        ))
        .await?;
    staging.approve_change(&update.change_id, "lead", Some("seasonal".into())).await?;
    staging.apply_change(&update.change_id, "lead").await?;
    assert_eq!(remote.get(EntityType::Product, &entity_id), Some(lamp(45.0, "cool white")));

    let rollback = engine
        .rollbacks()
        .rollback(&update.change_id, "ops", Some("wrong price".into()))
        .await?;
    assert_eq!(rollback.status, RollbackStatus::Completed);
    assert_eq!(rollback.rollback_data, Some(lamp(39.0, "warm white")));
    assert_eq!(remote.get(EntityType::Product, &entity_id), Some(lamp(39.0, "warm white")));

    let rolled_back = staging.get_change(&update.change_id).await?;
    assert_eq!(rolled_back.status, ChangeStatus::RolledBack);

    let completed = engine.rollbacks().list_rollbacks(RollbackStatus::Completed).await?;
    assert_eq!(completed.len(), 1);
    Ok(())
}

#[tokio::test]
async fn delete_rolls_back_as_recreate() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let entity_id = create_lamp(&engine).await?;
    let staging = engine.staging();

    let delete = staging
        .stage_change(StageRequest::new(
            EntityType::Product,
            Some(entity_id.clone()),
            ChangeType::Delete,
            None,
        ))
        .await?;
    staging.approve_change(&delete.change_id, "lead", None).await?;
    staging.apply_change(&delete.change_id, "lead").await?;
    assert!(remote.is_empty());

    engine.rollbacks().rollback(&delete.change_id, "ops", None).await?;
    assert_eq!(remote.len(), 1);
    Ok(())
}

#[tokio::test]
async fn auto_approved_change_applies_without_reviewer() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let mut rule = NewApprovalRule::new("small product edits", false, 10);
    rule.entity_type = Some(EntityType::Product);
    engine.approvals().create_rule(rule).await?;

    let entity_id = create_lamp(&engine).await?;
    let staged = engine
        .staging()
        .stage_change(StageRequest::new(
            EntityType::Product,
            Some(entity_id.clone()),
            ChangeType::Update,
            Some(lamp(41.0, "warm white")),
        ))
        .await?;

    assert!(staged.auto_approved);
    assert!(staged.reviewed_by.is_none());
    assert_eq!(staged.status, ChangeStatus::Approved);

    let progress = engine.staging().apply_approved_changes(50, "scheduler").await?;
    assert_eq!(progress.batch.successful_items, 1);
    assert_eq!(remote.get(EntityType::Product, &entity_id), Some(lamp(41.0, "warm white")));
    Ok(())
}

#[tokio::test]
async fn conflicting_change_waits_for_review_then_applies() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let entity_id = create_lamp(&engine).await?;

    // The remote moved the price on its own in the meantime
    remote.insert(EntityType::Product, entity_id.clone(), lamp(42.0, "warm white"));

    let staged = engine
        .staging()
        .stage_local_edit(EntityType::Product, &entity_id, lamp(44.0, "warm white"))
        .await?;
    assert!(staged.has_conflicts);
    assert_eq!(staged.conflict_fields, vec!["price".to_string()]);
    assert_eq!(engine.conflicts().open_conflict_count(), 1);

    let result = engine.staging().apply_change(&staged.change_id, "editor").await;
    assert!(matches!(result, Err(SyncError::InvalidTransition { .. })));

    let approved = engine.staging().approve_change(&staged.change_id, "lead", None).await?;
    assert!(approved.conflict_resolution.is_some());
    assert_eq!(engine.conflicts().open_conflict_count(), 0);
    let applied = engine.staging().apply_change(&staged.change_id, "lead").await?;
    assert_eq!(applied.status, ChangeStatus::Applied);
    Ok(())
}

#[tokio::test]
async fn rejected_change_never_applies() -> Result<()> {
    let (engine, _remote) = engine_with_remote().await?;
    let staged = engine
        .staging()
        .stage_change(StageRequest::new(
            EntityType::Product,
            None,
            ChangeType::Create,
            Some(lamp(10.0, "x")),
        ))
        .await?;
    engine.staging().reject_change(&staged.change_id, "lead", None).await?;

    assert!(engine.staging().approve_change(&staged.change_id, "lead", None).await.is_err());
    assert_eq!(
        engine.staging().list_changes(ChangeStatus::Rejected, 10).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_applies_to_one_entity_form_a_version_chain() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let entity_id = create_lamp(&engine).await?;
    let staging = engine.staging();

    let mut change_ids = Vec::new();
    for price in [20.0, 30.0] {
        let staged = staging
            .stage_change(StageRequest::new(
                EntityType::Product,
                Some(entity_id.clone()),
                ChangeType::Update,
                Some(lamp(price, "warm white")),
            ))
            .await?;
        staging.approve_change(&staged.change_id, "lead", None).await?;
        change_ids.push(staged.change_id);
    }

    remote.set_latency(Duration::from_millis(40));
    let (first, second) = tokio::join!(
        staging.apply_change(&change_ids[0], "lead"),
        staging.apply_change(&change_ids[1], "lead"),
    );
    remote.set_latency(Duration::ZERO);

    let mut applied = vec![first?, second?];
    applied.sort_by_key(|c| c.application_result.as_ref().and_then(|r| r.version_number));
    let (earlier, later) = (&applied[0], &applied[1]);
    let earlier_result = earlier.application_result.clone().unwrap();
    let later_result = later.application_result.clone().unwrap();

    assert_eq!(earlier_result.version_number, Some(2));
    assert_eq!(later_result.version_number, Some(3));
    assert_eq!(later.previous_version_id, earlier_result.version_id);
    assert_ne!(earlier.previous_version_id, later.previous_version_id);
    assert_eq!(later.rollback_data, earlier.proposed_data);

    // 나중 변경을 되돌리면 바로 앞 변경의 상태로 돌아감
    engine.rollbacks().rollback(&later.change_id, "ops", None).await?;
    assert_eq!(remote.get(EntityType::Product, &entity_id), earlier.proposed_data);
    Ok(())
}

#[tokio::test]
async fn restore_of_live_entity_updates_in_place() -> Result<()> {
    let (engine, remote) = engine_with_remote().await?;
    let entity_id = create_lamp(&engine).await?;
    let staging = engine.staging();

    let restore = staging
        .stage_change(StageRequest::new(
            EntityType::Product,
            Some(entity_id.clone()),
            ChangeType::Restore,
            Some(lamp(39.0, "restored")),
        ))
        .await?;
    staging.approve_change(&restore.change_id, "lead", None).await?;
    let applied = staging.apply_change(&restore.change_id, "lead").await?;

    assert_eq!(remote.len(), 1);
    assert_eq!(remote.get(EntityType::Product, &entity_id), Some(lamp(39.0, "restored")));
    assert_eq!(applied.entity_id.as_deref(), Some(entity_id.as_str()));
    Ok(())
}
