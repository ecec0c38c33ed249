//! Shared model integration tests: optimistic versioning and change notifications

mod common;

use common::*;
use modhub_core::registry::ModuleDescriptor;
use modhub_core::shared_model::{RecordFilter, SharedModelError};
use modhub_core::{ConflictError, FieldSpec};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

async fn define_invoice(harness: &TestHarness) {
    harness
        .ctx
        .shared_models()
        .define_model(
            "Invoice",
            BTreeMap::from([
                ("amount".to_string(), FieldSpec::required("float")),
                ("status".to_string(), FieldSpec::required("string")),
            ]),
        )
        .await
        .expect("define Invoice");
}

#[tokio::test]
async fn test_stale_expected_version_is_a_conflict() {
    let harness = TestHarness::new();
    define_invoice(&harness).await;
    let models = harness.ctx.shared_models();

    let created = models
        .create("Invoice", json!({"amount": 100.0, "status": "open"}), "clerk")
        .await
        .unwrap();
    assert_eq!(created.version, 1);

    let paid = models
        .update("Invoice", created.id, json!({"status": "paid"}), 1, "cashier")
        .await
        .unwrap();
    assert_eq!(paid.version, 2);
    assert_eq!(paid.get("amount"), Some(&json!(100.0)));
    assert_eq!(paid.get("status"), Some(&json!("paid")));

    let stale = models
        .update("Invoice", created.id, json!({"status": "cancelled"}), 1, "auditor")
        .await;
    assert_eq!(
        stale,
        Err(SharedModelError::Conflict(ConflictError {
            model: "Invoice".to_string(),
            id: created.id,
            expected_version: 1,
            current_version: 2,
        }))
    );

    let stored = models.get("Invoice", created.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.get("status"), Some(&json!("paid")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_at_the_same_version_have_one_winner() {
    let harness = TestHarness::new();
    define_invoice(&harness).await;
    let models = Arc::clone(harness.ctx.shared_models());
    let created = models
        .create("Invoice", json!({"amount": 10.0, "status": "open"}), "clerk")
        .await
        .unwrap();

    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let models = Arc::clone(&models);
            let id = created.id;
            tokio::spawn(async move {
                models
                    .update(
                        "Invoice",
                        id,
                        json!({"status": format!("writer-{writer}")}),
                        1,
                        &format!("writer-{writer}"),
                    )
                    .await
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(record) => winners.push(record),
            Err(error) => {
                assert!(error.is_conflict(), "unexpected error: {error}");
                conflicts += 1;
            }
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 7);

    let stored = models.get("Invoice", created.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.get("status"), winners[0].get("status"));
    assert_eq!(stored.updated_by, winners[0].updated_by);
}

#[tokio::test]
async fn test_conflicting_writer_succeeds_after_rereading() {
    let harness = TestHarness::new();
    define_invoice(&harness).await;
    let models = harness.ctx.shared_models();
    let created = models
        .create("Invoice", json!({"amount": 5.0, "status": "open"}), "clerk")
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        models.update("Invoice", created.id, json!({"amount": 6.0}), 1, "a"),
        models.update("Invoice", created.id, json!({"status": "disputed"}), 1, "b"),
    );
    assert!(first.is_ok() != second.is_ok());

    let current = models.get("Invoice", created.id).await.unwrap().unwrap();
    let retried = if first.is_err() {
        models
            .update("Invoice", created.id, json!({"amount": 6.0}), current.version, "a")
            .await
    } else {
        models
            .update("Invoice", created.id, json!({"status": "disputed"}), current.version, "b")
            .await
    }
    .unwrap();
    assert_eq!(retried.version, 3);
    assert_eq!(retried.get("amount"), Some(&json!(6.0)));
    assert_eq!(retried.get("status"), Some(&json!("disputed")));
}

#[tokio::test]
async fn test_dependent_modules_are_notified_of_changes() {
    let harness = TestHarness::started();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Invoice", "1.0"),
            RecordingHandler::new().as_handler(),
        )
        .await
        .unwrap();
    let reports = RecordingHandler::new();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Reports", "1.0").depends_on("Invoice", "*"),
            reports.as_handler(),
        )
        .await
        .unwrap();
    define_invoice(&harness).await;

    let models = harness.ctx.shared_models();
    let created = models
        .create("Invoice", json!({"amount": 1.0, "status": "open"}), "clerk")
        .await
        .unwrap();
    models
        .update("Invoice", created.id, json!({"status": "paid"}), 1, "cashier")
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || reports.count() == 2).await);
    let received = reports.received();
    assert_eq!(received[0].0, "record_created");
    assert_eq!(received[1].0, "record_updated");
    assert_eq!(received[1].1["version"], json!(2));
    assert_eq!(received[1].1["actor"], json!("cashier"));
    assert_eq!(received[1].1["changed_fields"], json!(["status"]));

    harness.ctx.shutdown().await;
}

#[tokio::test]
async fn test_archived_records_leave_default_queries() {
    let harness = TestHarness::new();
    define_invoice(&harness).await;
    let models = harness.ctx.shared_models();
    let open = models
        .create("Invoice", json!({"amount": 1.0, "status": "open"}), "clerk")
        .await
        .unwrap();
    models
        .create("Invoice", json!({"amount": 2.0, "status": "open"}), "clerk")
        .await
        .unwrap();

    models.archive("Invoice", open.id, 1, "clerk").await.unwrap();

    let visible = models
        .find("Invoice", &RecordFilter::new().field_eq("status", "open"))
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_ne!(visible[0].id, open.id);
    assert!(matches!(
        models.archive("Invoice", open.id, 2, "clerk").await,
        Err(SharedModelError::Archived { .. })
    ));
}

#[tokio::test]
async fn test_schemas_survive_a_restore() {
    let harness = TestHarness::new();
    define_invoice(&harness).await;

    let restored = modhub_core::OrchestrationContext::new(
        modhub_core::ConfigManager::from_config(fast_config(), "test").unwrap(),
        Arc::clone(harness.ctx.store()),
        harness.clock.clone(),
    );
    assert!(restored.shared_models().schema("Invoice").is_none());
    restored.restore().await.unwrap();
    assert_eq!(restored.shared_models().models(), vec!["Invoice".to_string()]);
}
