//! Module registration and message bus integration tests

mod common;

use common::*;
use modhub_core::messaging::{
    DeliveryError, DeliveryStatus, HandlerTable, MessageSource, SendOptions,
};
use modhub_core::registry::{ModuleDescriptor, RegistrationError};
use modhub_core::ModHubError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn install_billing_and_permits(
    harness: &TestHarness,
) -> (RecordingHandler, RecordingHandler) {
    let billing = RecordingHandler::new();
    let permits = RecordingHandler::new();
    let mut descriptors = billing_and_permits().into_iter();
    for handler in [&billing, &permits] {
        let descriptor = descriptors.next().expect("fixture descriptor");
        harness
            .ctx
            .install_module(descriptor, handler.as_handler())
            .await
            .expect("install module");
    }
    (billing, permits)
}

#[tokio::test]
async fn test_declared_dependency_may_send_and_unknown_sender_may_not() {
    let harness = TestHarness::started();
    let (_billing, permits) = install_billing_and_permits(&harness).await;
    let bus = harness.ctx.bus();

    let receipt = bus
        .send(
            "Billing",
            "Permits",
            "invoice_paid",
            json!({"invoice": 42}),
            SendOptions::sync(),
        )
        .await
        .expect("Billing is a declared dependency of Permits");
    assert_eq!(receipt.reply, Some(json!({"ok": true})));
    assert_eq!(
        permits.received(),
        vec![("invoice_paid".to_string(), json!({"invoice": 42}))]
    );

    let refused = bus
        .send("Unknown", "Permits", "invoice_paid", json!({}), SendOptions::new())
        .await;
    assert!(matches!(
        refused,
        Err(DeliveryError::DependencyNotSatisfied { ref sender, ref target })
            if sender == "Unknown" && target == "Permits"
    ));
    assert_eq!(permits.count(), 1);

    harness.ctx.shutdown().await;
}

#[tokio::test]
async fn test_system_sender_bypasses_dependency_policy() {
    let harness = TestHarness::started();
    let (_billing, permits) = install_billing_and_permits(&harness).await;

    harness
        .ctx
        .bus()
        .send(
            MessageSource::system("scheduler"),
            "Permits",
            "nightly_check",
            json!({}),
            SendOptions::sync(),
        )
        .await
        .expect("system senders are not subject to module dependencies");
    assert_eq!(permits.count(), 1);

    harness.ctx.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_target_is_rejected() {
    let harness = TestHarness::started();
    install_billing_and_permits(&harness).await;

    let result = harness
        .ctx
        .bus()
        .send("Billing", "Licenses", "hello", json!({}), SendOptions::new())
        .await;
    assert!(matches!(
        result,
        Err(DeliveryError::TargetNotRegistered { ref target }) if target == "Licenses"
    ));
    assert!(result.unwrap_err().is_permanent());
}

#[tokio::test]
async fn test_registration_requires_satisfied_dependencies() {
    let harness = TestHarness::new();

    let missing = harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", ">=1.0"),
            RecordingHandler::new().as_handler(),
        )
        .await;
    assert!(matches!(
        missing,
        Err(ModHubError::Registration(RegistrationError::DependencyUnmet { .. }))
    ));

    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Billing", "1.4"),
            RecordingHandler::new().as_handler(),
        )
        .await
        .unwrap();
    let too_new = harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", "^2.0"),
            RecordingHandler::new().as_handler(),
        )
        .await;
    assert!(matches!(
        too_new,
        Err(ModHubError::Registration(RegistrationError::DependencyUnmet { .. }))
    ));

    let duplicate = harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Billing", "1.5"),
            RecordingHandler::new().as_handler(),
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(ModHubError::Registration(RegistrationError::DuplicateName { .. }))
    ));
}

#[tokio::test]
async fn test_module_with_dependents_cannot_be_uninstalled() {
    let harness = TestHarness::new();
    install_billing_and_permits(&harness).await;

    let blocked = harness.ctx.uninstall_module("Billing").await;
    assert!(matches!(
        blocked,
        Err(ModHubError::Registration(RegistrationError::HasDependents { .. }))
    ));

    harness.ctx.uninstall_module("Permits").await.unwrap();
    harness.ctx.uninstall_module("Billing").await.unwrap();
    assert!(harness.ctx.registry().list().is_empty());
    assert!(!harness.ctx.bus().has_handler("Billing"));
}

#[tokio::test]
async fn test_messages_between_a_pair_arrive_in_send_order_despite_retries() {
    let harness = TestHarness::started();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Billing", "1.0"),
            RecordingHandler::new().as_handler(),
        )
        .await
        .unwrap();
    let permits = RecordingHandler::new().failing_first(2);
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", "*"),
            permits.as_handler(),
        )
        .await
        .unwrap();

    for sequence in 0..20 {
        harness
            .ctx
            .bus()
            .send(
                "Billing",
                "Permits",
                "invoice_paid",
                json!({"sequence": sequence}),
                SendOptions::new(),
            )
            .await
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || permits.count() == 20).await);
    let order: Vec<i64> = permits
        .received()
        .iter()
        .map(|(_, payload)| payload["sequence"].as_i64().unwrap())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
    assert!(harness.ctx.bus().stats().retried >= 2);

    assert!(harness.ctx.shutdown().await);
}

#[tokio::test]
async fn test_queued_messages_are_delivered_after_restart() {
    let before = TestHarness::new();
    install_billing_and_permits(&before).await;
    let bus = before.ctx.bus();
    let mut sent = Vec::new();
    for n in 0..3 {
        let receipt = bus
            .send("Billing", "Permits", "invoice_paid", json!({"n": n}), SendOptions::new())
            .await
            .unwrap();
        sent.push(receipt.message_id);
    }
    let timed_out = bus
        .send(
            "Billing",
            "Permits",
            "invoice_paid",
            json!({"n": 3}),
            SendOptions::sync().with_timeout(Duration::from_millis(20)),
        )
        .await;
    let Err(DeliveryError::DeliveryTimeout { message_id, .. }) = timed_out else {
        panic!("expected a delivery timeout, got {timed_out:?}");
    };
    sent.push(message_id);

    // Workers never ran in the first process
    let after = before.restarted();
    after.ctx.restore().await.unwrap();
    let permits = RecordingHandler::new();
    after.ctx.bus().attach_handler("Permits", permits.as_handler());
    after.ctx.start();

    assert!(wait_until(Duration::from_secs(5), || permits.count() == 4).await);
    let order: Vec<i64> = permits
        .received()
        .iter()
        .map(|(_, payload)| payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3]);

    assert!(after.ctx.shutdown().await);
    for id in sent {
        let message = after.ctx.bus().message(id).await.unwrap().unwrap();
        assert_eq!(message.status, DeliveryStatus::Delivered);
    }

    // A second restore finds nothing left to recover
    let again = after.restarted();
    assert_eq!(again.ctx.bus().recover_queued().await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_and_can_be_requeued() {
    let harness = TestHarness::started();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Billing", "1.0"),
            RecordingHandler::new().as_handler(),
        )
        .await
        .unwrap();
    let permits = RecordingHandler::new().failing_first(3);
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Permits", "1.0").depends_on("Billing", "*"),
            permits.as_handler(),
        )
        .await
        .unwrap();

    let result = harness
        .ctx
        .bus()
        .send("Billing", "Permits", "invoice_paid", json!({"n": 1}), SendOptions::sync())
        .await;
    assert!(matches!(result, Err(DeliveryError::Transient { .. })));

    let report = harness.ctx.diagnostics().report().await.unwrap();
    assert_eq!(report.dead_letters.len(), 1);
    assert_eq!(report.dead_letters[0].attempts, 3);
    assert_eq!(report.dead_letters[0].target, "Permits");
    assert!(!report.is_clean());

    let dead = harness.ctx.bus().dead_letters().await.unwrap();
    harness
        .ctx
        .bus()
        .requeue_dead_letter(dead[0].message.id)
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || permits.count() == 1).await);
    assert!(harness.ctx.bus().dead_letters().await.unwrap().is_empty());
    let redelivered = harness.ctx.bus().message(dead[0].message.id).await.unwrap().unwrap();
    assert_eq!(redelivered.requeues, 1);

    assert!(harness.ctx.shutdown().await);
}

#[tokio::test]
async fn test_unknown_message_type_fails_without_retry() {
    let harness = TestHarness::started();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Permits", "1.0"),
            Arc::new(HandlerTable::new().on("permit_issued", |payload| async move { Ok(payload) })),
        )
        .await
        .unwrap();

    let result = harness
        .ctx
        .bus()
        .send(
            MessageSource::system("test"),
            "Permits",
            "permit_revoked",
            json!({}),
            SendOptions::sync(),
        )
        .await;
    assert!(matches!(
        result,
        Err(DeliveryError::UnknownMessageType { ref message_type, .. }) if message_type == "permit_revoked"
    ));
    let stats = harness.ctx.bus().stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 0);

    harness.ctx.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reports_each_target_separately() {
    let harness = TestHarness::started();
    let (_billing, permits) = install_billing_and_permits(&harness).await;
    let inspections = RecordingHandler::new();
    harness
        .ctx
        .install_module(
            ModuleDescriptor::new("Inspections", "1.0").depends_on("Permits", "*"),
            inspections.as_handler(),
        )
        .await
        .unwrap();

    let report = harness
        .ctx
        .bus()
        .broadcast("Billing", "fiscal_year_closed", json!({"year": 2026}), None)
        .await;
    assert_eq!(report.len(), 2);
    assert_eq!(report.succeeded(), vec!["Permits"]);
    let failed = report.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "Inspections");
    assert!(matches!(failed[0].1, DeliveryError::DependencyNotSatisfied { .. }));
    assert!(!report.all_succeeded());

    assert!(wait_until(Duration::from_secs(5), || permits.count() == 1).await);
    assert_eq!(inspections.count(), 0);

    harness.ctx.shutdown().await;
}

#[tokio::test]
async fn test_sends_are_refused_after_shutdown() {
    let harness = TestHarness::started();
    install_billing_and_permits(&harness).await;
    assert!(harness.ctx.shutdown().await);

    let result = harness
        .ctx
        .bus()
        .send("Billing", "Permits", "invoice_paid", json!({}), SendOptions::new())
        .await;
    assert!(matches!(result, Err(DeliveryError::ShuttingDown)));
}
