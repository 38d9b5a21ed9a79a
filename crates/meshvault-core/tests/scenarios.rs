//! End-to-end behaviour of an assembled asset store

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshvault_core::{
    AssetStore, Config, CoreError, MetadataValue, ModelUpdate, NewModel, NewProject,
    RepositoryError, RetryPolicy, SearchQuery,
};
use meshvault_storage::rusqlite::{ffi, Connection};
use meshvault_storage::{
    Database, Direction, ErrorHandler, MigrationManager, StorageError, TransactionManager,
};

fn config() -> Config {
    let mut config = Config::new(PathBuf::from("unused"));
    config.cache.secondary_dir = None;
    config.start_monitor = false;
    config.retry = RetryPolicy {
        base_delay_ms: 1,
        max_delay_ms: 4,
        ..RetryPolicy::default()
    };
    config
}

fn store() -> AssetStore {
    AssetStore::open_in_memory(config()).unwrap()
}

fn gear() -> NewModel {
    NewModel::new("gear.stl", "parts/gear.stl", "abc123", 4096, "stl")
}

fn busy() -> StorageError {
    StorageError::Sqlite(meshvault_storage::rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_BUSY),
        Some("database is locked".to_string()),
    ))
}

#[test]
fn scenario_a_created_model_reads_back() {
    let store = store();
    let id = store.models().create(gear()).unwrap();

    let model = store.models().read(&id).unwrap().unwrap();
    assert_eq!(model.id, id);
    assert_eq!(model.name, "gear.stl");
    assert_eq!(model.content_hash, "abc123");
    assert_eq!(model.size_bytes, 4096);
    assert_eq!(model.format, "stl");
    assert_eq!(model.created_at, model.modified_at);
}

#[test]
fn scenario_b_shared_hash_is_allowed_and_searchable() {
    let store = store();
    let first = store.models().create(gear()).unwrap();
    let second = store
        .models()
        .create(NewModel::new("gear copy", "backup/gear.stl", "abc123", 4096, "stl"))
        .unwrap();
    store
        .models()
        .create(NewModel::new("bracket", "parts/bracket.stl", "def456", 100, "stl"))
        .unwrap();

    let hits = store
        .search()
        .search(&SearchQuery::default().with_content_hash("abc123"))
        .unwrap();
    let ids: HashSet<String> = hits.into_iter().map(|h| h.model.id).collect();
    assert_eq!(ids, HashSet::from([first.clone(), second.clone()]));

    let groups = store.search().find_duplicates().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].content_hash, "abc123");
    assert_eq!(groups[0].models.len(), 2);
}

#[test]
fn scenario_c_read_after_update_is_never_stale() {
    let store = store();
    let id = store.models().create(gear()).unwrap();

    // Warm the cache with the old name
    assert_eq!(store.models().read(&id).unwrap().unwrap().name, "gear.stl");

    store
        .models()
        .update(
            &id,
            ModelUpdate {
                name: Some("gear_v2.stl".to_string()),
                ..ModelUpdate::default()
            },
        )
        .unwrap();

    assert_eq!(store.models().read(&id).unwrap().unwrap().name, "gear_v2.stl");
    let hits = store.search().search(&SearchQuery::text("gear_v2")).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn scenario_d_migrations_from_empty_store_are_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let handler = ErrorHandler::new(db.clone(), RetryPolicy::default());
    let tm = TransactionManager::new(db, handler);
    let migrations = MigrationManager::builtin(tm).unwrap();

    assert_eq!(migrations.current_version().unwrap(), 0);
    assert_eq!(migrations.apply_migrations(None).unwrap(), 3);
    assert_eq!(migrations.current_version().unwrap(), 3);

    let history = migrations.history().unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.direction == Direction::Up));

    assert_eq!(migrations.apply_migrations(None).unwrap(), 3);
    assert_eq!(migrations.current_version().unwrap(), 3);
    assert_eq!(migrations.history().unwrap().len(), 3);
    assert!(migrations.pending(None).unwrap().is_empty());
}

#[test]
fn scenario_e_lock_errors_on_commit_are_retried() {
    let store = store();
    let remaining = Arc::new(AtomicU32::new(3));
    let failures = Arc::clone(&remaining);
    store
        .transaction_manager()
        .set_pre_commit_hook(Some(Arc::new(move |_conn: &Connection| {
            match failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(busy()),
                Err(_) => Ok(()),
            }
        })));

    let id = store.models().create(gear()).unwrap();
    store.transaction_manager().set_pre_commit_hook(None);

    assert_eq!(remaining.load(Ordering::SeqCst), 0);
    assert!(store.models().exists(&id).unwrap());

    let sample = store.health().sample_now();
    assert_eq!(sample.recovery_attempts, 3);

    let report = store.health().generate_report();
    assert_eq!(report.recovery.attempts, 3);
    assert_eq!(report.recovery.recovered, 1);
    assert_eq!(store.transaction_manager().stats().retries, 3);
}

#[test]
fn lock_errors_beyond_retry_budget_fail() {
    let store = store();
    store
        .transaction_manager()
        .set_pre_commit_hook(Some(Arc::new(|_conn: &Connection| Err(busy()))));

    let err = store.models().create(gear()).unwrap_err();
    store.transaction_manager().set_pre_commit_hook(None);

    assert!(matches!(
        err,
        RepositoryError::Storage {
            source: StorageError::LockTimeout { .. },
            ..
        }
    ));
    assert_eq!(store.models().count().unwrap(), 0);
}

#[test]
fn deleting_a_model_cascades() {
    let store = store();
    let id = store.models().create(gear()).unwrap();
    store
        .metadata()
        .set(&id, "material", MetadataValue::from("steel"))
        .unwrap();
    let project = store.projects().create(NewProject::new("Robot")).unwrap();
    assert!(store.projects().add_model(&project, &id).unwrap());

    // Warm caches that the delete must invalidate
    assert_eq!(store.metadata().read(&id).unwrap().len(), 1);
    assert_eq!(store.projects().models(&project).unwrap().len(), 1);

    assert!(store.models().delete(&id).unwrap());

    assert!(store.models().read(&id).unwrap().is_none());
    assert!(store.metadata().read(&id).unwrap().is_empty());
    assert!(store.projects().models(&project).unwrap().is_empty());
    assert!(store
        .search()
        .search(&SearchQuery::text("steel"))
        .unwrap()
        .is_empty());
}

#[test]
fn multi_repository_transaction_is_atomic() {
    let store = store();
    let existing = store.models().create(gear()).unwrap();

    let result = store.transaction(|_tx| {
        let id = store.models().create(NewModel::new(
            "sprocket",
            "parts/sprocket.obj",
            "77aa",
            12,
            "obj",
        ))?;
        store
            .metadata()
            .set(&id, "material", MetadataValue::from("brass"))?;
        store.models().update(
            &existing,
            ModelUpdate {
                name: Some("renamed".to_string()),
                ..ModelUpdate::default()
            },
        )?;
        // Second project with the same name (case-insensitive) must fail
        store.projects().create(NewProject::new("Shop"))?;
        store.projects().create(NewProject::new("SHOP"))?;
        Ok(id)
    });

    match result {
        Err(CoreError::Repository(RepositoryError::Duplicate { .. })) => {}
        other => panic!("expected duplicate project error, got {:?}", other.map(|_| ())),
    }

    assert_eq!(store.models().count().unwrap(), 1);
    assert_eq!(store.models().read(&existing).unwrap().unwrap().name, "gear.stl");
    assert_eq!(store.projects().count().unwrap(), 0);
    assert!(store
        .search()
        .search(&SearchQuery::text("sprocket"))
        .unwrap()
        .is_empty());
    assert_eq!(store.transaction_manager().stats().open, 0);
}

#[test]
fn committed_transaction_is_visible_everywhere() {
    let store = store();

    let (model, project) = store
        .transaction(|_tx| {
            let model = store.models().create(gear())?;
            store
                .metadata()
                .set(&model, "tags", MetadataValue::from("Mech, Drive"))?;
            let project = store.projects().create(NewProject::new("Drive train"))?;
            store.projects().add_model(&project, &model)?;
            Ok((model, project))
        })
        .unwrap();

    assert_eq!(store.metadata().tags(&model).unwrap(), vec!["drive", "mech"]);
    assert_eq!(store.projects().models(&project).unwrap()[0].id, model);
    let hits = store
        .search()
        .search(&SearchQuery::default().with_tag("mech"))
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path().to_path_buf());
    config.start_monitor = false;

    let id = {
        let store = AssetStore::open(config.clone()).unwrap();
        let id = store.models().create(gear()).unwrap();
        store
            .metadata()
            .set(
                &id,
                "print",
                MetadataValue::from(serde_json::json!({"layer_mm": 0.2, "supports": true})),
            )
            .unwrap();
        // Populate the disk tier
        store.models().read(&id).unwrap();
        assert!(store.cache().stats().secondary_entries > 0);
        store.shutdown(Duration::from_secs(1)).unwrap();
        id
    };

    let store = AssetStore::open(config).unwrap();
    // Secondary tier starts empty after a restart
    assert_eq!(store.cache().stats().secondary_entries, 0);
    assert_eq!(store.migrations().current_version().unwrap(), 3);
    let entry = store.metadata().get(&id, "print").unwrap().unwrap();
    assert_eq!(
        entry.value,
        MetadataValue::Nested(serde_json::json!({"layer_mm": 0.2, "supports": true}))
    );
    assert_eq!(store.models().read(&id).unwrap().unwrap().name, "gear.stl");
}

#[test]
fn health_report_reflects_store_activity() {
    let store = store();
    let id = store.models().create(gear()).unwrap();
    for _ in 0..5 {
        store.models().read(&id).unwrap();
    }

    let sample = store.health().sample_now();
    assert!(sample.query_count >= 2);
    assert_eq!(sample.error_rate, 0.0);

    let json = store.health().generate_report().to_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(parsed.get("status").is_some());
    assert!(parsed["cache"]["hits"].as_u64().unwrap() >= 4);
}
