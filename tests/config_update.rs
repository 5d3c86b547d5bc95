//! Live configuration updates: diff classification, preservation of
//! in-flight aggregation, condition cache reseeding, dimension-limit
//! reclamping.

use std::time::Duration;

use telemetryd::compiler;
use telemetryd::condition::ConditionState;
use telemetryd::event::{Event, FieldAnnotations, Value};
use telemetryd::report::BucketValue;
use telemetryd::spec::{
    AtomMatcherDef, ConfigKey, CountMetricDef, DurationAggregation, DurationMetricDef,
    FieldMatcher, FieldValueMatcher, InitialConditionValue, LogicalOperation, MatcherCombination,
    MatcherKind, PredicateCombination, PredicateDef, PredicateKind, SimpleAtomMatcher,
    SimplePredicate, TelemetryConfig, ValueMatcher,
};
use telemetryd::Engine;

const SEC: i64 = 1_000_000_000;
const KEY: ConfigKey = ConfigKey { uid: 1000, id: 1 };

const WAKELOCK_ATOM: i32 = 10;
const SCREEN_ATOM: i32 = 29;
const BATTERY_ATOM: i32 = 12;

fn simple_matcher(id: i64, atom_id: i32) -> AtomMatcherDef {
    AtomMatcherDef {
        id,
        kind: MatcherKind::Simple(SimpleAtomMatcher {
            atom_id,
            field_value_matchers: vec![],
        }),
    }
}

fn field_eq_matcher(id: i64, atom_id: i32, field: i32, value: i64) -> AtomMatcherDef {
    AtomMatcherDef {
        id,
        kind: MatcherKind::Simple(SimpleAtomMatcher {
            atom_id,
            field_value_matchers: vec![FieldValueMatcher {
                field,
                position: None,
                value: ValueMatcher::EqInt(value),
            }],
        }),
    }
}

fn combination_matcher(id: i64, operation: LogicalOperation, children: Vec<i64>) -> AtomMatcherDef {
    AtomMatcherDef {
        id,
        kind: MatcherKind::Combination(MatcherCombination {
            operation,
            children,
        }),
    }
}

fn simple_predicate(id: i64, start: i64, stop: i64) -> PredicateDef {
    PredicateDef {
        id,
        kind: PredicateKind::Simple(SimplePredicate {
            start,
            stop,
            stop_all: None,
            dimensions: None,
            initial_value: InitialConditionValue::Unknown,
            count_nesting: false,
        }),
    }
}

fn count_metric(id: i64, what: i64) -> CountMetricDef {
    CountMetricDef {
        id,
        what,
        condition: None,
        slice_by_states: vec![],
        dimensions_in_what: None,
        links: vec![],
        bucket: Duration::from_secs(60),
        max_dimensions_per_bucket: None,
    }
}

fn wakelock_event(ts: i64, uid: i32, acquire: bool) -> Event {
    let mut e = Event::new(WAKELOCK_ATOM, uid, ts);
    e.push_annotated(
        &[1],
        Value::Int(uid),
        FieldAnnotations {
            is_uid: true,
            ..Default::default()
        },
    );
    e.push(&[3], Value::Int(if acquire { 1 } else { 0 }));
    e
}

fn screen_event(ts: i64, value: i64) -> Event {
    let mut e = Event::new(SCREEN_ATOM, 1000, ts);
    e.push(&[1], Value::Long(value));
    e
}

/// Matcher update classification across an update: preserved, replaced,
/// transitively replaced, and new nodes.
#[test]
fn test_matcher_update_classification_through_engine() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![
        simple_matcher(1, 10),
        simple_matcher(2, 11),
        combination_matcher(3, LogicalOperation::Or, vec![1, 2]),
    ];
    engine.set_config(KEY, config.clone(), 0).expect("install");

    let mut new_config = config;
    new_config.atom_matchers[1] = simple_matcher(2, 111);
    new_config.atom_matchers.push(simple_matcher(4, 13));
    new_config
        .atom_matchers
        .push(combination_matcher(5, LogicalOperation::And, vec![2, 4]));

    let diff = engine.set_config(KEY, new_config, SEC).expect("update");
    let mut replaced: Vec<i64> = diff.replaced_matchers.iter().copied().collect();
    replaced.sort_unstable();
    assert_eq!(replaced, vec![2, 3]);
}

/// A preserved count metric keeps its open-bucket accumulation across an
/// unrelated update.
#[test]
fn test_preserved_metric_keeps_accumulation() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![simple_matcher(1, 10), simple_matcher(2, 11)];
    config.count_metrics = vec![count_metric(100, 1)];
    engine.set_config(KEY, config.clone(), 0).expect("install");

    for ts in 0..5 {
        engine.on_event(Event::new(10, 0, ts * SEC));
    }

    // Replace the unrelated matcher 2; the metric rides through.
    let mut new_config = config;
    new_config.atom_matchers[1] = simple_matcher(2, 12);
    let diff = engine.set_config(KEY, new_config, 6 * SEC).expect("update");
    assert!(diff.replaced_matchers.contains(&2));
    assert!(!diff.replaced_metrics.contains(&100));

    for ts in 6..9 {
        engine.on_event(Event::new(10, 0, ts * SEC));
    }

    let report = engine.flush_and_clear(KEY, 20 * SEC).expect("report");
    let total: i64 = report.metrics[0]
        .buckets
        .iter()
        .map(|b| match b.value {
            BucketValue::Count(c) => c,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 8, "counts before and after the update accumulate");
}

/// A replaced metric starts from scratch.
#[test]
fn test_replaced_metric_resets_accumulation() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![simple_matcher(1, 10)];
    config.count_metrics = vec![count_metric(100, 1)];
    engine.set_config(KEY, config.clone(), 0).expect("install");

    for ts in 0..5 {
        engine.on_event(Event::new(10, 0, ts * SEC));
    }

    let mut new_config = config;
    new_config.atom_matchers[0] = {
        let mut m = simple_matcher(1, 10);
        if let MatcherKind::Simple(s) = &mut m.kind {
            s.field_value_matchers.push(FieldValueMatcher {
                field: 1,
                position: None,
                value: ValueMatcher::GteInt(0),
            });
        }
        m
    };
    let diff = engine.set_config(KEY, new_config, 6 * SEC).expect("update");
    assert!(diff.replaced_metrics.contains(&100));

    let report = engine.flush_and_clear(KEY, 20 * SEC).expect("report");
    let total: i64 = report.metrics[0]
        .buckets
        .iter()
        .map(|b| match b.value {
            BucketValue::Count(c) => c,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 0, "pre-update counts were discarded with the old producer");
}

/// Condition cache seeding: a new NOT combination over a preserved FALSE
/// predicate starts TRUE.
#[test]
fn test_condition_cache_seeded_from_live_state() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![
        field_eq_matcher(1, SCREEN_ATOM, 1, 2),
        field_eq_matcher(2, SCREEN_ATOM, 1, 1),
    ];
    config.predicates = vec![simple_predicate(10, 1, 2)];
    // A metric keeps the predicate wired into dispatch.
    let mut metric = count_metric(100, 1);
    metric.condition = Some(10);
    config.count_metrics = vec![metric];
    engine.set_config(KEY, config.clone(), 0).expect("install");

    // Drive the predicate to FALSE.
    engine.on_event(screen_event(SEC, 1));
    assert_eq!(
        engine.condition_state(KEY, 10),
        Some(ConditionState::False)
    );

    let mut new_config = config;
    new_config.predicates.push(PredicateDef {
        id: 11,
        kind: PredicateKind::Combination(PredicateCombination {
            operation: LogicalOperation::Not,
            children: vec![10],
        }),
    });
    engine.set_config(KEY, new_config, 2 * SEC).expect("update");

    assert_eq!(
        engine.condition_state(KEY, 10),
        Some(ConditionState::False),
        "preserved predicate carries its live value"
    );
    assert_eq!(
        engine.condition_state(KEY, 11),
        Some(ConditionState::True),
        "fresh NOT combination seeds from the preserved child"
    );
}

/// Duration propagation: wakelocks held by two uids survive an update that
/// replaces an unrelated predicate; the durations keep accruing from their
/// original start instants.
#[test]
fn test_duration_trackers_survive_unrelated_replacement() {
    let engine = Engine::new(0);
    let uid_dim = FieldMatcher::leaf(1);

    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![
        field_eq_matcher(1, WAKELOCK_ATOM, 3, 1),
        field_eq_matcher(2, WAKELOCK_ATOM, 3, 0),
        field_eq_matcher(3, BATTERY_ATOM, 1, 1),
        field_eq_matcher(4, BATTERY_ATOM, 1, 0),
    ];
    config.predicates = vec![
        PredicateDef {
            id: 10,
            kind: PredicateKind::Simple(SimplePredicate {
                start: 1,
                stop: 2,
                stop_all: None,
                dimensions: Some(uid_dim.clone()),
                initial_value: InitialConditionValue::False,
                count_nesting: true,
            }),
        },
        simple_predicate(11, 3, 4),
    ];
    config.duration_metrics = vec![DurationMetricDef {
        id: 100,
        what: 10,
        condition: None,
        slice_by_states: vec![],
        dimensions_in_what: Some(uid_dim),
        links: vec![],
        aggregation: DurationAggregation::Sum,
        bucket: Duration::from_secs(600),
        max_dimensions_per_bucket: None,
    }];
    // The battery predicate gates a separate metric so it stays referenced.
    let mut battery_metric = count_metric(101, 3);
    battery_metric.condition = Some(11);
    config.count_metrics = vec![battery_metric];
    engine.set_config(KEY, config.clone(), 0).expect("install");

    // Two uids acquire before the update.
    engine.on_event(wakelock_event(SEC, 10, true));
    engine.on_event(wakelock_event(2 * SEC, 11, true));
    assert_eq!(engine.condition_state(KEY, 10), Some(ConditionState::True));

    // Replace a dependency of the battery predicate only.
    let mut new_config = config;
    new_config.atom_matchers[3] = field_eq_matcher(4, BATTERY_ATOM, 1, 2);
    let diff = engine.set_config(KEY, new_config, 3 * SEC).expect("update");
    assert!(diff.replaced_conditions.contains(&11));
    assert!(!diff.replaced_conditions.contains(&10));
    assert!(!diff.replaced_metrics.contains(&100));

    // The wakelock predicate is still TRUE in the new arena.
    assert_eq!(engine.condition_state(KEY, 10), Some(ConditionState::True));

    // Releases after the update close intervals measured from the original
    // acquisitions.
    engine.on_event(wakelock_event(6 * SEC, 10, false));
    engine.on_event(wakelock_event(7 * SEC, 11, false));

    let report = engine.flush_and_clear(KEY, 10 * SEC).expect("report");
    let duration_metric = report
        .metrics
        .iter()
        .find(|m| m.metric_id == 100)
        .expect("duration metric");
    let duration_for = |uid: i64| -> i64 {
        duration_metric
            .buckets
            .iter()
            .filter(|b| b.key.ends_with(&format!("={uid}")))
            .map(|b| match b.value {
                BucketValue::DurationNs(d) => d,
                _ => 0,
            })
            .sum()
    };
    assert_eq!(duration_for(10), 5 * SEC);
    assert_eq!(duration_for(11), 5 * SEC);
}

/// Dimension-limit reclamping across updates, without metric replacement.
#[test]
fn test_dimension_limit_update_policy() {
    let cases = [
        (900u32, 900u32, 900usize),
        (1000, 850, 850),
        (1100, 1500, 1500),
        (800, 799, 800),
        (3000, 3001, 3000),
        (800, 0, 800),
    ];
    for (old_limit, new_limit, expected) in cases {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        let mut metric = count_metric(100, 1);
        metric.dimensions_in_what = Some(FieldMatcher::leaf(1));
        metric.max_dimensions_per_bucket = Some(old_limit);
        config.count_metrics = vec![metric];

        let old = compiler::compile(KEY, config.clone(), 0, 0).expect("compile");
        let old_generation = old.metrics[0].generation();

        let mut new_config = config;
        new_config.count_metrics[0].max_dimensions_per_bucket = Some(new_limit);
        let (updated, diff) = compiler::update(KEY, new_config, old, SEC).expect("update");

        assert!(
            diff.replaced_metrics.is_empty(),
            "{old_limit}->{new_limit}: limit change must not replace the metric"
        );
        assert_eq!(
            updated.metrics[0].generation(),
            old_generation,
            "{old_limit}->{new_limit}: producer identity preserved"
        );
        assert_eq!(
            updated.metrics[0].common.dim_limit, expected,
            "{old_limit}->{new_limit}"
        );
    }
}

/// Removing a config tears it down; a fresh install starts clean.
#[test]
fn test_remove_and_reinstall() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![simple_matcher(1, 10)];
    config.count_metrics = vec![count_metric(100, 1)];
    engine.set_config(KEY, config.clone(), 0).expect("install");
    engine.on_event(Event::new(10, 0, SEC));

    engine.remove_config(KEY);
    assert!(engine.flush(KEY, 2 * SEC).is_none());
    assert_eq!(engine.config_count(), 0);

    engine.set_config(KEY, config, 3 * SEC).expect("reinstall");
    let report = engine.flush_and_clear(KEY, 4 * SEC).expect("report");
    let total: i64 = report.metrics[0]
        .buckets
        .iter()
        .map(|b| match b.value {
            BucketValue::Count(c) => c,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 0);
}

/// Matcher cycles are rejected and the running config stays untouched.
#[test]
fn test_cycle_rejected_atomically() {
    let engine = Engine::new(0);
    let mut config = TelemetryConfig::new(1);
    config.atom_matchers = vec![simple_matcher(1, 10)];
    config.count_metrics = vec![count_metric(100, 1)];
    engine.set_config(KEY, config.clone(), 0).expect("install");
    engine.on_event(Event::new(10, 0, SEC));

    let mut bad = config;
    bad.atom_matchers.push(combination_matcher(
        2,
        LogicalOperation::Or,
        vec![3],
    ));
    bad.atom_matchers.push(combination_matcher(
        3,
        LogicalOperation::Or,
        vec![2],
    ));
    let err = engine.set_config(KEY, bad, 2 * SEC).expect_err("cycle");
    assert!(matches!(
        err,
        telemetryd::ConfigError::MatcherCycle(2) | telemetryd::ConfigError::MatcherCycle(3)
    ));

    // Old config still runs and kept its accumulation.
    engine.on_event(Event::new(10, 0, 3 * SEC));
    let report = engine.flush_and_clear(KEY, 4 * SEC).expect("report");
    let total: i64 = report.metrics[0]
        .buckets
        .iter()
        .map(|b| match b.value {
            BucketValue::Count(c) => c,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 2);
}
