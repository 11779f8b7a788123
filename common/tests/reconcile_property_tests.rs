// Property-based tests for batch reconciliation
// Convergence, idempotence and tombstone handling over shuffled batches

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use common::models::{ChangeKind, ChangeNotification, ScheduleKey, ScheduleRecord};
use common::reconcile::{FixedClock, Reconciler, ReconcilerConfig};
use common::store::{MemoryStateStore, StateStore};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap()
}

fn reconciler() -> Reconciler<MemoryStateStore> {
    Reconciler::with_clock(
        MemoryStateStore::new(),
        ReconcilerConfig {
            pacing: Duration::ZERO,
        },
        Arc::new(FixedClock(base_time())),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn kind_strategy() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Create),
        Just(ChangeKind::Update),
        Just(ChangeKind::Delete),
    ]
}

/// Events with distinct event times across a few schedule names
fn events_strategy() -> impl Strategy<Value = Vec<ChangeNotification>> {
    prop::collection::vec((kind_strategy(), 0usize..NAMES.len(), 0u32..48), 1..12).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(seq, (kind, name, hour))| ChangeNotification {
                    kind,
                    event_time: base_time() + ChronoDuration::seconds(seq as i64 + 1),
                    group_name: "g".to_string(),
                    schedule_name: NAMES[name].to_string(),
                    schedule_expression: (kind != ChangeKind::Delete).then(|| {
                        let fire = base_time().naive_utc() + ChronoDuration::hours(hour as i64 + 1);
                        format!("at({})", fire.format("%Y-%m-%dT%H:%M:%S"))
                    }),
                    schedule_expression_timezone: Some("Europe/Berlin".to_string()),
                    client_token: None,
                    action_after_completion: None,
                })
                .collect()
        },
    )
}

async fn final_state(
    reconciler: &Reconciler<MemoryStateStore>,
) -> Vec<Option<ScheduleRecord>> {
    let mut state = Vec::new();
    for name in NAMES {
        let key = ScheduleKey::new("g", name).unwrap();
        state.push(reconciler.store().get(&key).await.unwrap());
    }
    state
}

/// **Property: Convergence under reordering**
///
/// *For any* batch of events, delivering it in any order leaves every key
/// holding the record derived from its latest event.
#[test]
fn property_convergence_under_reordering() {
    proptest!(|(
        (events, shuffled) in events_strategy()
            .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle()))
    )| {
        let rt = runtime();
        let (in_order, reordered) = rt.block_on(async {
            let first = reconciler();
            first.reconcile_batch(events.clone()).await;

            // Split the shuffled events into single-item batches so the
            // per-batch sort cannot mask ordering problems
            let second = reconciler();
            for event in shuffled {
                second.reconcile_batch(vec![event]).await;
            }

            (final_state(&first).await, final_state(&second).await)
        });

        prop_assert_eq!(&in_order, &reordered);

        for (name, record) in NAMES.iter().zip(in_order.iter()) {
            let latest = events
                .iter()
                .filter(|e| e.schedule_name == *name)
                .max_by_key(|e| e.event_time);
            match (latest, record) {
                (None, None) => {}
                (Some(latest), Some(record)) => {
                    prop_assert_eq!(record.last_event_time, latest.event_time);
                    prop_assert_eq!(record.is_tombstone(), latest.kind == ChangeKind::Delete);
                }
                (latest, record) => {
                    prop_assert!(false, "mismatch {:?} vs {:?}", latest, record);
                }
            }
        }
    });
}

/// **Property: Idempotence under replay**
///
/// *For any* batch, reconciling it a second time applies nothing and leaves
/// the store unchanged.
#[test]
fn property_replay_is_idempotent() {
    proptest!(|(events in events_strategy())| {
        let rt = runtime();
        let (before, after, replay) = rt.block_on(async {
            let reconciler = reconciler();
            reconciler.reconcile_batch(events.clone()).await;
            let before = final_state(&reconciler).await;
            let replay = reconciler.reconcile_batch(events.clone()).await;
            (before, final_state(&reconciler).await, replay)
        });

        prop_assert_eq!(before, after);
        prop_assert_eq!(replay.applied, 0);
        prop_assert_eq!(replay.superseded, events.len());
    });
}

/// **Property: Tombstone precedence**
///
/// *For any* create and delete of the same schedule, the later one wins
/// regardless of which arrives first.
#[test]
fn property_tombstone_precedence() {
    proptest!(|(
        create_offset in 1i64..1000,
        delete_offset in 1i64..1000,
        delete_first in any::<bool>()
    )| {
        prop_assume!(create_offset != delete_offset);

        let event = |kind: ChangeKind, offset: i64| ChangeNotification {
            kind,
            event_time: base_time() + ChronoDuration::seconds(offset),
            group_name: "g".to_string(),
            schedule_name: "alpha".to_string(),
            schedule_expression: (kind == ChangeKind::Create)
                .then(|| "at(2025-06-01T08:00:00)".to_string()),
            schedule_expression_timezone: None,
            client_token: None,
            action_after_completion: None,
        };
        let create = event(ChangeKind::Create, create_offset);
        let delete = event(ChangeKind::Delete, delete_offset);
        let deliveries = if delete_first {
            vec![vec![delete], vec![create]]
        } else {
            vec![vec![create], vec![delete]]
        };

        let rt = runtime();
        let record = rt.block_on(async {
            let reconciler = reconciler();
            for batch in deliveries {
                reconciler.reconcile_batch(batch).await;
            }
            reconciler
                .store()
                .get(&ScheduleKey::new("g", "alpha").unwrap())
                .await
                .unwrap()
                .unwrap()
        });

        if delete_offset > create_offset {
            prop_assert!(record.is_tombstone());
            prop_assert!(record.execution_time.is_none());
        } else {
            prop_assert!(!record.is_tombstone());
            prop_assert!(record.execution_time.is_some());
        }
    });
}

/// **Property: Unresolvable expressions are skipped**
///
/// *For any* non-delete event whose expression cannot be resolved, nothing
/// is written.
#[test]
fn property_unresolvable_expression_skipped() {
    proptest!(|(
        kind in prop_oneof![Just(ChangeKind::Create), Just(ChangeKind::Update)],
        expression in prop_oneof![
            Just(None),
            Just(Some("rate(5 minutes)".to_string())),
            Just(Some("cron(0 12 * * ? *)".to_string())),
            "[a-z]{1,12}".prop_map(Some),
        ]
    )| {
        let event = ChangeNotification {
            kind,
            event_time: base_time(),
            group_name: "g".to_string(),
            schedule_name: "alpha".to_string(),
            schedule_expression: expression,
            schedule_expression_timezone: None,
            client_token: None,
            action_after_completion: None,
        };

        let rt = runtime();
        let (report, empty) = rt.block_on(async {
            let reconciler = reconciler();
            let report = reconciler.reconcile_batch(vec![event]).await;
            (report, reconciler.store().is_empty())
        });

        prop_assert_eq!(report.skipped, 1);
        prop_assert_eq!(report.applied, 0);
        prop_assert!(empty);
    });
}
