use alert_notifier::{
    clients::traits::Database,
    models::{
        check::{CheckData, MetricState},
        escalation::EscalationEvent,
        status::State,
        subscription::EscalationData,
    },
    services::escalation::EscalationProcessor,
};
use anyhow::Result;

use crate::common::{
    MemoryDatabase, RecordingSender, build_fanout, contact, event, fanout_config, fixed_now, trigger,
};

fn escalation(id: &str, state: State, timestamp: i64, is_final: bool, is_resolution: bool) -> EscalationEvent {
    EscalationEvent {
        escalation: EscalationData {
            id: id.to_string(),
            offset_in_minutes: 10,
            contacts: vec!["lead".into()],
        },
        event: event("T1", "m", state, State::Ok, timestamp),
        trigger: trigger("T1", &["prod"]),
        subscription_id: "S1".into(),
        timestamp,
        is_final,
        is_resolution,
    }
}

fn seeded() -> std::sync::Arc<MemoryDatabase> {
    let database = MemoryDatabase::new();
    database.add_contact(contact("lead", "hook", "team-lead"));
    database
}

/// Test: A due step notifies its contacts and the final step closes the obligation
#[tokio::test]
async fn test_final_step_is_sent_and_acknowledged() -> Result<()> {
    let database = seeded();
    let now = fixed_now().timestamp();
    database
        .add_escalations(&[escalation("E1", State::Error, now, true, false)])
        .await?;

    let fanout = build_fanout(&database, fanout_config());
    let sender = RecordingSender::new(true);
    fanout.register_sender("hook", sender.clone());
    let processor = EscalationProcessor::new(database.clone(), fanout.clone());

    assert_eq!(processor.process_escalations(fixed_now()).await?, 1);
    fanout.stop().await;

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].contact_value, "team-lead");
    assert!(sent[0].need_ack);

    assert!(!database.has_pending_escalations("T1", "m").await?);
    assert!(database.is_escalation_processed("T1", "m", "E1").await?);
    Ok(())
}

/// Test: Intermediate steps keep the obligation pending
#[tokio::test]
async fn test_intermediate_step_stays_pending() -> Result<()> {
    let database = seeded();
    let now = fixed_now().timestamp();
    database
        .add_escalations(&[
            escalation("E1", State::Error, now, false, false),
            escalation("E2", State::Error, now + 600, true, false),
        ])
        .await?;

    let fanout = build_fanout(&database, fanout_config());
    let processor = EscalationProcessor::new(database.clone(), fanout.clone());

    processor.process_escalations(fixed_now()).await?;
    fanout.stop().await;

    assert!(database.has_pending_escalations("T1", "m").await?);
    assert_eq!(database.state().escalations.len(), 1);
    Ok(())
}

/// Test: Recovered metrics and acknowledged alerts do not escalate
#[tokio::test]
async fn test_recovered_or_acknowledged_are_skipped() -> Result<()> {
    let database = seeded();
    let now = fixed_now().timestamp();
    database
        .add_escalations(&[escalation("E1", State::Error, now, false, false)])
        .await?;
    let mut check = CheckData::default();
    check.metrics.insert(
        "m".into(),
        MetricState {
            state: State::Ok,
            timestamp: now,
            event_timestamp: now,
        },
    );
    database.state().last_checks.insert("T1".into(), check);

    let fanout = build_fanout(&database, fanout_config());
    let sender = RecordingSender::new(true);
    fanout.register_sender("hook", sender.clone());
    let processor = EscalationProcessor::new(database.clone(), fanout.clone());

    assert_eq!(processor.process_escalations(fixed_now()).await?, 0);

    database
        .add_escalations(&[escalation("E2", State::Error, now, false, false)])
        .await?;
    database.ack_escalations("T1", "m", false).await?;
    database.state().last_checks.clear();
    assert_eq!(processor.process_escalations(fixed_now()).await?, 0);

    fanout.stop().await;
    assert!(sender.sent().is_empty());
    Ok(())
}

/// Test: Resolutions reach only the steps that already fired
#[tokio::test]
async fn test_resolution_after_processed_step() -> Result<()> {
    let database = seeded();
    database.add_contact(contact("boss", "hook", "head"));
    let now = fixed_now().timestamp();
    database
        .add_escalations(&[
            escalation("E1", State::Error, now, false, false),
            escalation("E2", State::Error, now + 600, true, false),
        ])
        .await?;

    let fanout = build_fanout(&database, fanout_config());
    let sender = RecordingSender::new(true);
    fanout.register_sender("hook", sender.clone());
    let processor = EscalationProcessor::new(database.clone(), fanout.clone());
    processor.process_escalations(fixed_now()).await?;

    database.state().escalations.clear();
    let mut second = escalation("E2", State::Ok, now + 60, false, true);
    second.escalation.contacts = vec!["boss".into()];
    database
        .add_escalations(&[escalation("E1", State::Ok, now + 60, false, true), second])
        .await?;

    let later = fixed_now() + chrono::TimeDelta::minutes(1);
    assert_eq!(processor.process_escalations(later).await?, 1);
    fanout.stop().await;

    let sent = sender.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.contact_value == "team-lead"));
    assert_eq!(sent.iter().filter(|p| !p.need_ack).count(), 1);
    assert!(!database.is_escalation_processed("T1", "m", "E1").await?);
    assert!(!database.has_pending_escalations("T1", "m").await?);
    Ok(())
}
