//! Configuration compiler and live update.
//!
//! `compile` turns a [`TelemetryConfig`] into index-addressed tracker
//! arenas plus the wiring maps the dispatcher consumes. `update` diffs a
//! new configuration against the running artifacts: every node whose
//! definition and transitive dependencies are unchanged is *preserved* —
//! the live tracker object moves into the new arena, accumulation intact —
//! while everything else is rebuilt. Installation is atomic: any error
//! leaves the old artifacts untouched.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::anomaly::{AlarmTracker, AnomalyTracker};
use crate::condition::{self, ConditionState, ConditionTracker, ConditionTrackerKind};
use crate::error::ConfigError;
use crate::matchers::{self, MatcherTracker};
use crate::metrics::activation::{Activation, ActivationState};
use crate::metrics::{
    self, CompiledLink, CountMetric, DurationMetric, EventMetric, GaugeMetric, KllMetric,
    MetricProducer, MetricVariant, StateSlice, ValueMetric,
};
use crate::spec::{
    AtomMatcherDef, ConfigKey, MatcherKind, MetricActivation, PredicateDef, PredicateKind,
    TelemetryConfig, MAX_ALARMS, MAX_ALERTS, MAX_MATCHERS, MAX_METRICS, MAX_PREDICATES,
};

/// Diff classification of one node across an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Unknown,
    Preserve,
    Replace,
    New,
}

/// Ids whose trackers were rebuilt by an update, per layer.
#[derive(Debug, Default, Clone)]
pub struct UpdateDiff {
    pub replaced_matchers: HashSet<i64>,
    pub replaced_conditions: HashSet<i64>,
    pub replaced_states: HashSet<i64>,
    pub replaced_metrics: HashSet<i64>,
    pub replaced_alerts: HashSet<i64>,
}

/// Live artifacts of one installed configuration.
#[derive(Debug)]
pub struct CompiledConfig {
    pub key: ConfigKey,
    pub config: TelemetryConfig,
    pub time_base_ns: i64,

    pub matchers: Vec<MatcherTracker>,
    pub matcher_index: HashMap<i64, usize>,
    pub tag_to_matchers: HashMap<i32, Vec<usize>>,

    pub conditions: Vec<ConditionTracker>,
    pub condition_index: HashMap<i64, usize>,
    pub matcher_to_conditions: HashMap<usize, Vec<usize>>,
    pub condition_cache: Vec<ConditionState>,

    pub state_hashes: HashMap<i64, [u8; 32]>,

    pub metrics: Vec<MetricProducer>,
    pub metric_index: HashMap<i64, usize>,
    pub matcher_to_metrics: HashMap<usize, Vec<usize>>,
    pub condition_to_metrics: HashMap<usize, Vec<usize>>,
    pub activation_to_metrics: HashMap<usize, Vec<usize>>,
    pub deactivation_to_metrics: HashMap<usize, Vec<usize>>,
    pub metrics_with_activation: Vec<usize>,
    pub no_report_metrics: HashSet<i64>,

    pub alerts: Vec<AnomalyTracker>,
    pub alert_index: HashMap<i64, usize>,
    pub alarms: Vec<AlarmTracker>,
}

impl CompiledConfig {
    /// Atom ids of every state slice, with multiplicity, for state-manager
    /// registration bookkeeping.
    pub fn state_atom_refs(&self) -> Vec<i32> {
        self.metrics
            .iter()
            .flat_map(|m| m.common.state_slices.iter().map(|s| s.atom_id))
            .collect()
    }

    /// True when any matcher can fire for this atom.
    pub fn interested_in_atom(&self, atom_id: i32) -> bool {
        self.tag_to_matchers.contains_key(&atom_id)
    }

    /// Earliest periodic-alarm instant, seconds.
    pub fn next_alarm_sec(&self) -> Option<i64> {
        self.alarms.iter().map(|a| a.next_fire_sec()).min()
    }

    /// Earliest predicted anomaly crossing, nanoseconds.
    pub fn next_predicted_anomaly_ns(&self) -> Option<i64> {
        self.alerts.iter().filter_map(|a| a.earliest_pending_ns()).min()
    }
}

/// Compiles a configuration from scratch.
pub fn compile(
    key: ConfigKey,
    config: TelemetryConfig,
    time_base_ns: i64,
    current_ns: i64,
) -> Result<CompiledConfig, ConfigError> {
    let compiled = build(key, config, time_base_ns, current_ns)?;
    info!(
        config = %key,
        matchers = compiled.matchers.len(),
        conditions = compiled.conditions.len(),
        metrics = compiled.metrics.len(),
        alerts = compiled.alerts.len(),
        alarms = compiled.alarms.len(),
        "config compiled"
    );
    Ok(compiled)
}

/// Applies a new configuration over running artifacts.
///
/// On success the preserved trackers have moved into the returned
/// artifacts; on failure the old artifacts come back untouched alongside
/// the error.
pub fn update(
    key: ConfigKey,
    new_config: TelemetryConfig,
    old: CompiledConfig,
    current_ns: i64,
) -> Result<(CompiledConfig, UpdateDiff), (ConfigError, CompiledConfig)> {
    // Everything fallible happens before any old tracker moves.
    let diff = match compute_diff(&new_config, &old) {
        Ok(diff) => diff,
        Err(e) => return Err((e, old)),
    };
    let fresh = match build(key, new_config, old.time_base_ns, current_ns) {
        Ok(fresh) => fresh,
        Err(e) => return Err((e, old)),
    };

    let merged = swap_preserved(fresh, old, &diff);
    info!(
        config = %key,
        replaced_matchers = diff.replaced_matchers.len(),
        replaced_conditions = diff.replaced_conditions.len(),
        replaced_metrics = diff.replaced_metrics.len(),
        replaced_alerts = diff.replaced_alerts.len(),
        "config updated"
    );
    Ok((merged, diff))
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Computes per-layer update statuses and the replaced-id sets.
pub fn compute_diff(
    new_config: &TelemetryConfig,
    old: &CompiledConfig,
) -> Result<UpdateDiff, ConfigError> {
    let mut diff = UpdateDiff::default();

    // Matchers.
    let new_matcher_index = index_by(new_config.atom_matchers.iter().map(|m| m.id))
        .map_err(ConfigError::MatcherDuplicate)?;
    let old_matcher_defs: HashMap<i64, &AtomMatcherDef> =
        old.config.atom_matchers.iter().map(|m| (m.id, m)).collect();
    let mut matcher_statuses = vec![UpdateStatus::Unknown; new_config.atom_matchers.len()];
    let mut cycle = vec![CycleMark::White; new_config.atom_matchers.len()];
    for idx in 0..new_config.atom_matchers.len() {
        determine_matcher_update_status(
            new_config,
            idx,
            &old_matcher_defs,
            &new_matcher_index,
            &mut matcher_statuses,
            &mut cycle,
        )?;
    }
    for (idx, status) in matcher_statuses.iter().enumerate() {
        if *status == UpdateStatus::Replace {
            diff.replaced_matchers.insert(new_config.atom_matchers[idx].id);
        }
    }

    // Conditions.
    let new_condition_index = index_by(new_config.predicates.iter().map(|p| p.id))
        .map_err(ConfigError::ConditionDuplicate)?;
    let old_condition_defs: HashMap<i64, &PredicateDef> =
        old.config.predicates.iter().map(|p| (p.id, p)).collect();
    let mut condition_statuses = vec![UpdateStatus::Unknown; new_config.predicates.len()];
    let mut cycle = vec![CycleMark::White; new_config.predicates.len()];
    for idx in 0..new_config.predicates.len() {
        determine_condition_update_status(
            new_config,
            idx,
            &old_condition_defs,
            &new_condition_index,
            &diff.replaced_matchers,
            &mut condition_statuses,
            &mut cycle,
        )?;
    }
    for (idx, status) in condition_statuses.iter().enumerate() {
        if *status == UpdateStatus::Replace {
            diff.replaced_conditions.insert(new_config.predicates[idx].id);
        }
    }

    // States: diff by stored content hash.
    for state in &new_config.states {
        let new_hash = state.content_hash();
        match old.state_hashes.get(&state.id) {
            Some(old_hash) if *old_hash == new_hash => {}
            Some(_) => {
                diff.replaced_states.insert(state.id);
            }
            None => {}
        }
    }

    // Metrics.
    let old_activations: HashMap<i64, &MetricActivation> = old
        .config
        .metric_activations
        .iter()
        .map(|a| (a.metric_id, a))
        .collect();
    let new_activations: HashMap<i64, &MetricActivation> = new_config
        .metric_activations
        .iter()
        .map(|a| (a.metric_id, a))
        .collect();
    for def in metric_defs(new_config) {
        let id = def.id();
        let Some(old_def) = find_metric_def(&old.config, id) else {
            continue;
        };
        let activation_changed = old_activations.get(&id).map(|a| (*a).clone())
            != new_activations.get(&id).map(|a| (*a).clone());
        if !defs_equal(&def, &old_def)
            || activation_changed
            || def.depends_on_replaced(&diff)
            || activation_uses_replaced_matcher(new_activations.get(&id), &diff.replaced_matchers)
        {
            diff.replaced_metrics.insert(id);
        }
    }

    // Alerts.
    let old_alert_defs: HashMap<i64, &crate::spec::AlertDef> =
        old.config.alerts.iter().map(|a| (a.id, a)).collect();
    for alert in &new_config.alerts {
        let Some(old_def) = old_alert_defs.get(&alert.id) else {
            continue;
        };
        if *old_def != alert || diff.replaced_metrics.contains(&alert.metric_id) {
            diff.replaced_alerts.insert(alert.id);
        }
    }

    Ok(diff)
}

#[derive(Clone, Copy, PartialEq)]
enum CycleMark {
    White,
    Gray,
    Black,
}

fn determine_matcher_update_status(
    new_config: &TelemetryConfig,
    idx: usize,
    old_defs: &HashMap<i64, &AtomMatcherDef>,
    new_index: &HashMap<i64, usize>,
    statuses: &mut [UpdateStatus],
    cycle: &mut [CycleMark],
) -> Result<(), ConfigError> {
    if statuses[idx] != UpdateStatus::Unknown {
        return Ok(());
    }
    let def = &new_config.atom_matchers[idx];
    match cycle[idx] {
        CycleMark::Gray => return Err(ConfigError::MatcherCycle(def.id)),
        CycleMark::Black => return Ok(()),
        CycleMark::White => {}
    }

    let Some(old_def) = old_defs.get(&def.id) else {
        statuses[idx] = UpdateStatus::New;
        cycle[idx] = CycleMark::Black;
        return Ok(());
    };
    if *old_def != def {
        statuses[idx] = UpdateStatus::Replace;
        cycle[idx] = CycleMark::Black;
        return Ok(());
    }

    match &def.kind {
        MatcherKind::Simple(_) => {
            statuses[idx] = UpdateStatus::Preserve;
            cycle[idx] = CycleMark::Black;
        }
        MatcherKind::Combination(combo) => {
            cycle[idx] = CycleMark::Gray;
            let mut any_changed = false;
            for child_id in &combo.children {
                let child_idx = *new_index
                    .get(child_id)
                    .ok_or(ConfigError::MatcherChildNotFound(def.id))?;
                determine_matcher_update_status(
                    new_config, child_idx, old_defs, new_index, statuses, cycle,
                )?;
                if matches!(
                    statuses[child_idx],
                    UpdateStatus::Replace | UpdateStatus::New
                ) {
                    any_changed = true;
                }
            }
            statuses[idx] = if any_changed {
                UpdateStatus::Replace
            } else {
                UpdateStatus::Preserve
            };
            cycle[idx] = CycleMark::Black;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn determine_condition_update_status(
    new_config: &TelemetryConfig,
    idx: usize,
    old_defs: &HashMap<i64, &PredicateDef>,
    new_index: &HashMap<i64, usize>,
    replaced_matchers: &HashSet<i64>,
    statuses: &mut [UpdateStatus],
    cycle: &mut [CycleMark],
) -> Result<(), ConfigError> {
    if statuses[idx] != UpdateStatus::Unknown {
        return Ok(());
    }
    let def = &new_config.predicates[idx];
    match cycle[idx] {
        CycleMark::Gray => return Err(ConfigError::ConditionCycle(def.id)),
        CycleMark::Black => return Ok(()),
        CycleMark::White => {}
    }

    let Some(old_def) = old_defs.get(&def.id) else {
        statuses[idx] = UpdateStatus::New;
        cycle[idx] = CycleMark::Black;
        return Ok(());
    };
    if *old_def != def {
        statuses[idx] = UpdateStatus::Replace;
        cycle[idx] = CycleMark::Black;
        return Ok(());
    }

    match &def.kind {
        PredicateKind::Simple(simple) => {
            let mut matcher_ids = vec![simple.start, simple.stop];
            matcher_ids.extend(simple.stop_all);
            statuses[idx] = if matcher_ids.iter().any(|m| replaced_matchers.contains(m)) {
                UpdateStatus::Replace
            } else {
                UpdateStatus::Preserve
            };
            cycle[idx] = CycleMark::Black;
        }
        PredicateKind::Combination(combo) => {
            cycle[idx] = CycleMark::Gray;
            let mut any_changed = false;
            for child_id in &combo.children {
                let child_idx = *new_index
                    .get(child_id)
                    .ok_or(ConfigError::ConditionChildNotFound(def.id))?;
                determine_condition_update_status(
                    new_config,
                    child_idx,
                    old_defs,
                    new_index,
                    replaced_matchers,
                    statuses,
                    cycle,
                )?;
                if matches!(
                    statuses[child_idx],
                    UpdateStatus::Replace | UpdateStatus::New
                ) {
                    any_changed = true;
                }
            }
            statuses[idx] = if any_changed {
                UpdateStatus::Replace
            } else {
                UpdateStatus::Preserve
            };
            cycle[idx] = CycleMark::Black;
        }
    }
    Ok(())
}

fn activation_uses_replaced_matcher(
    activation: Option<&&MetricActivation>,
    replaced_matchers: &HashSet<i64>,
) -> bool {
    activation.is_some_and(|a| {
        a.event_activations.iter().any(|ea| {
            replaced_matchers.contains(&ea.atom_matcher_id)
                || ea
                    .deactivation_atom_matcher_id
                    .is_some_and(|d| replaced_matchers.contains(&d))
        })
    })
}

// ---------------------------------------------------------------------------
// Metric definition access across the six kinds
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum MetricDefRef<'a> {
    Event(&'a crate::spec::EventMetricDef),
    Count(&'a crate::spec::CountMetricDef),
    Duration(&'a crate::spec::DurationMetricDef),
    Gauge(&'a crate::spec::GaugeMetricDef),
    Value(&'a crate::spec::ValueMetricDef),
    Kll(&'a crate::spec::KllMetricDef),
}

impl MetricDefRef<'_> {
    fn id(&self) -> i64 {
        match self {
            MetricDefRef::Event(d) => d.id,
            MetricDefRef::Count(d) => d.id,
            MetricDefRef::Duration(d) => d.id,
            MetricDefRef::Gauge(d) => d.id,
            MetricDefRef::Value(d) => d.id,
            MetricDefRef::Kll(d) => d.id,
        }
    }

    fn condition(&self) -> Option<i64> {
        match self {
            MetricDefRef::Event(d) => d.condition,
            MetricDefRef::Count(d) => d.condition,
            MetricDefRef::Duration(d) => d.condition,
            MetricDefRef::Gauge(d) => d.condition,
            MetricDefRef::Value(d) => d.condition,
            MetricDefRef::Kll(d) => d.condition,
        }
    }

    fn links(&self) -> &[crate::spec::MetricConditionLink] {
        match self {
            MetricDefRef::Event(d) => &d.links,
            MetricDefRef::Count(d) => &d.links,
            MetricDefRef::Duration(d) => &d.links,
            MetricDefRef::Gauge(d) => &d.links,
            MetricDefRef::Value(d) => &d.links,
            MetricDefRef::Kll(d) => &d.links,
        }
    }

    fn slice_by_states(&self) -> &[i64] {
        match self {
            MetricDefRef::Count(d) => &d.slice_by_states,
            MetricDefRef::Duration(d) => &d.slice_by_states,
            MetricDefRef::Value(d) => &d.slice_by_states,
            _ => &[],
        }
    }

    /// True when any input named by the diff was rebuilt.
    fn depends_on_replaced(&self, diff: &UpdateDiff) -> bool {
        let what_replaced = match self {
            // Duration metrics are driven by a predicate.
            MetricDefRef::Duration(d) => diff.replaced_conditions.contains(&d.what),
            MetricDefRef::Event(d) => diff.replaced_matchers.contains(&d.what),
            MetricDefRef::Count(d) => diff.replaced_matchers.contains(&d.what),
            MetricDefRef::Gauge(d) => {
                diff.replaced_matchers.contains(&d.what)
                    || d.trigger_event_matcher
                        .is_some_and(|t| diff.replaced_matchers.contains(&t))
            }
            MetricDefRef::Value(d) => diff.replaced_matchers.contains(&d.what),
            MetricDefRef::Kll(d) => diff.replaced_matchers.contains(&d.what),
        };
        what_replaced
            || self
                .condition()
                .is_some_and(|c| diff.replaced_conditions.contains(&c))
            || self
                .links()
                .iter()
                .any(|l| diff.replaced_conditions.contains(&l.condition))
            || self
                .slice_by_states()
                .iter()
                .any(|s| diff.replaced_states.contains(s))
    }
}

fn metric_defs(config: &TelemetryConfig) -> Vec<MetricDefRef<'_>> {
    let mut out = Vec::with_capacity(config.metric_count());
    out.extend(config.event_metrics.iter().map(MetricDefRef::Event));
    out.extend(config.count_metrics.iter().map(MetricDefRef::Count));
    out.extend(config.duration_metrics.iter().map(MetricDefRef::Duration));
    out.extend(config.gauge_metrics.iter().map(MetricDefRef::Gauge));
    out.extend(config.value_metrics.iter().map(MetricDefRef::Value));
    out.extend(config.kll_metrics.iter().map(MetricDefRef::Kll));
    out
}

fn find_metric_def(config: &TelemetryConfig, id: i64) -> Option<MetricDefRef<'_>> {
    metric_defs(config).into_iter().find(|d| d.id() == id)
}

/// Definition equality for the diff. The dimension guardrail is excluded:
/// a limit change alone never replaces a metric, it re-clamps the live
/// producer (the update-dim-limit policy).
fn defs_equal(a: &MetricDefRef<'_>, b: &MetricDefRef<'_>) -> bool {
    match (a, b) {
        (MetricDefRef::Event(x), MetricDefRef::Event(y)) => x == y,
        (MetricDefRef::Count(x), MetricDefRef::Count(y)) => {
            let mut x = (*x).clone();
            let mut y = (*y).clone();
            x.max_dimensions_per_bucket = None;
            y.max_dimensions_per_bucket = None;
            x == y
        }
        (MetricDefRef::Duration(x), MetricDefRef::Duration(y)) => {
            let mut x = (*x).clone();
            let mut y = (*y).clone();
            x.max_dimensions_per_bucket = None;
            y.max_dimensions_per_bucket = None;
            x == y
        }
        (MetricDefRef::Gauge(x), MetricDefRef::Gauge(y)) => {
            let mut x = (*x).clone();
            let mut y = (*y).clone();
            x.max_dimensions_per_bucket = None;
            y.max_dimensions_per_bucket = None;
            x == y
        }
        (MetricDefRef::Value(x), MetricDefRef::Value(y)) => {
            let mut x = (*x).clone();
            let mut y = (*y).clone();
            x.max_dimensions_per_bucket = None;
            y.max_dimensions_per_bucket = None;
            x == y
        }
        (MetricDefRef::Kll(x), MetricDefRef::Kll(y)) => {
            let mut x = (*x).clone();
            let mut y = (*y).clone();
            x.max_dimensions_per_bucket = None;
            y.max_dimensions_per_bucket = None;
            x == y
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

fn index_by(ids: impl Iterator<Item = i64>) -> Result<HashMap<i64, usize>, i64> {
    let mut map = HashMap::new();
    for (idx, id) in ids.enumerate() {
        if map.insert(id, idx).is_some() {
            return Err(id);
        }
    }
    Ok(map)
}

fn validate_shape(config: &TelemetryConfig) -> Result<(), ConfigError> {
    if config.atom_matchers.len() > MAX_MATCHERS {
        return Err(ConfigError::TooManyMatchers(config.atom_matchers.len()));
    }
    if config.predicates.len() > MAX_PREDICATES {
        return Err(ConfigError::TooManyConditions(config.predicates.len()));
    }
    if config.metric_count() > MAX_METRICS {
        return Err(ConfigError::TooManyMetrics(config.metric_count()));
    }
    if config.alerts.len() > MAX_ALERTS {
        return Err(ConfigError::TooManyAlerts(config.alerts.len()));
    }
    if config.alarms.len() > MAX_ALARMS {
        return Err(ConfigError::TooManyAlarms(config.alarms.len()));
    }

    if config.restricted_metrics_delegate.is_some() {
        let non_event = metric_defs(config)
            .into_iter()
            .find(|d| !matches!(d, MetricDefRef::Event(_)));
        if let Some(d) = non_event {
            return Err(ConfigError::RestrictedMetricNotSupported(d.id()));
        }
    }

    Ok(())
}

/// Builds fresh artifacts for a configuration; all validation funnels
/// through here.
fn build(
    key: ConfigKey,
    config: TelemetryConfig,
    time_base_ns: i64,
    current_ns: i64,
) -> Result<CompiledConfig, ConfigError> {
    validate_shape(&config)?;

    // Matchers.
    let matcher_index = index_by(config.atom_matchers.iter().map(|m| m.id))
        .map_err(ConfigError::MatcherDuplicate)?;
    let mut matcher_trackers: Vec<MatcherTracker> = config
        .atom_matchers
        .iter()
        .map(MatcherTracker::new)
        .collect::<Result<_, _>>()?;
    matchers::init_matchers(&mut matcher_trackers, &matcher_index)?;

    let mut tag_to_matchers: HashMap<i32, Vec<usize>> = HashMap::new();
    for idx in 0..matcher_trackers.len() {
        let mut atom_ids = Vec::new();
        matchers::matcher_atom_ids(&matcher_trackers, idx, &mut atom_ids);
        for atom_id in atom_ids {
            tag_to_matchers.entry(atom_id).or_default().push(idx);
        }
    }

    // Conditions.
    let condition_index = index_by(config.predicates.iter().map(|p| p.id))
        .map_err(ConfigError::ConditionDuplicate)?;
    let mut condition_trackers: Vec<ConditionTracker> = config
        .predicates
        .iter()
        .map(ConditionTracker::new)
        .collect::<Result<_, _>>()?;
    condition::init_conditions(&mut condition_trackers, &condition_index, &matcher_index)?;

    let mut matcher_to_conditions: HashMap<usize, Vec<usize>> = HashMap::new();
    for (cond_idx, tracker) in condition_trackers.iter().enumerate() {
        for matcher_idx in tracker.interested_matchers() {
            let entry = matcher_to_conditions.entry(matcher_idx).or_default();
            if !entry.contains(&cond_idx) {
                entry.push(cond_idx);
            }
        }
    }
    // Combinations listen through their simple leaves.
    for (cond_idx, tracker) in condition_trackers.iter().enumerate() {
        if let ConditionTrackerKind::Combination(_) = tracker.kind {
            let mut leaves = Vec::new();
            collect_simple_leaves(&condition_trackers, cond_idx, &mut leaves);
            for leaf in leaves {
                for matcher_idx in condition_trackers[leaf].interested_matchers() {
                    let entry = matcher_to_conditions.entry(matcher_idx).or_default();
                    if !entry.contains(&cond_idx) {
                        entry.push(cond_idx);
                    }
                }
            }
        }
    }

    // States.
    let mut state_atom_ids: HashMap<i64, i32> = HashMap::new();
    let mut state_group_maps: HashMap<i64, HashMap<i32, i64>> = HashMap::new();
    let mut state_hashes: HashMap<i64, [u8; 32]> = HashMap::new();
    for state in &config.states {
        if state_atom_ids.insert(state.id, state.atom_id).is_some() {
            return Err(ConfigError::StateDuplicate(state.id));
        }
        let mut group_map = HashMap::new();
        for group in &state.groups {
            for value in &group.values {
                group_map.insert(*value, group.group_id);
            }
        }
        state_group_maps.insert(state.id, group_map);
        state_hashes.insert(state.id, state.content_hash());
    }

    // Metric activations, keyed by metric with duplicate detection.
    let mut activation_defs: HashMap<i64, &MetricActivation> = HashMap::new();
    for activation in &config.metric_activations {
        if activation_defs
            .insert(activation.metric_id, activation)
            .is_some()
        {
            return Err(ConfigError::MetricHasMultipleActivations(
                activation.metric_id,
            ));
        }
    }

    // Metrics.
    let defs = metric_defs(&config);
    let metric_index =
        index_by(defs.iter().map(|d| d.id())).map_err(ConfigError::MetricDuplicate)?;
    let mut metric_producers = Vec::with_capacity(defs.len());
    let mut matcher_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut condition_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut activation_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut deactivation_to_metrics: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut metrics_with_activation = Vec::new();

    for (metric_idx, def) in defs.iter().enumerate() {
        let producer = build_metric(
            def,
            &config,
            &matcher_trackers,
            &matcher_index,
            &condition_trackers,
            &condition_index,
            &state_atom_ids,
            &state_group_maps,
            activation_defs.get(&def.id()).copied(),
            time_base_ns,
            current_ns,
        )?;

        // Dispatch wiring. Durations listen on their predicate's matchers;
        // everything else on its what matcher, gauges additionally on the
        // trigger.
        match &producer.variant {
            MetricVariant::Duration(d) => {
                for idx in [Some(d.start_index), Some(d.stop_index), d.stop_all_index]
                    .into_iter()
                    .flatten()
                {
                    matcher_to_metrics.entry(idx).or_default().push(metric_idx);
                }
            }
            _ => {
                let what_id = match def {
                    MetricDefRef::Event(d) => d.what,
                    MetricDefRef::Count(d) => d.what,
                    MetricDefRef::Value(d) => d.what,
                    MetricDefRef::Kll(d) => d.what,
                    MetricDefRef::Gauge(d) => d.what,
                    MetricDefRef::Duration(d) => d.what,
                };
                let what_idx = matcher_index[&what_id];
                matcher_to_metrics
                    .entry(what_idx)
                    .or_default()
                    .push(metric_idx);
                if let MetricVariant::Gauge(g) = &producer.variant {
                    if let Some(trigger_idx) = g.trigger_index {
                        matcher_to_metrics
                            .entry(trigger_idx)
                            .or_default()
                            .push(metric_idx);
                    }
                }
            }
        }

        if let Some(cond_idx) = producer.common.condition_index {
            condition_to_metrics
                .entry(cond_idx)
                .or_default()
                .push(metric_idx);
        }
        if !producer.common.activation.is_empty() {
            metrics_with_activation.push(metric_idx);
            for activation in producer.common.activation.activations() {
                activation_to_metrics
                    .entry(activation.matcher_index)
                    .or_default()
                    .push(metric_idx);
                if let Some(deact) = activation.deactivation_index {
                    deactivation_to_metrics
                        .entry(deact)
                        .or_default()
                        .push(metric_idx);
                }
            }
        }

        metric_producers.push(producer);
    }

    // Activations for unknown metric ids are rejected.
    for metric_id in activation_defs.keys() {
        if !metric_index.contains_key(metric_id) {
            return Err(ConfigError::ActivationUnknownMetric(*metric_id));
        }
    }

    // No-report set.
    let mut no_report_metrics = HashSet::new();
    for id in &config.no_report_metrics {
        if !metric_index.contains_key(id) {
            return Err(ConfigError::NoReportMetricNotFound(*id));
        }
        no_report_metrics.insert(*id);
    }

    // Alerts.
    let alert_index =
        index_by(config.alerts.iter().map(|a| a.id)).map_err(ConfigError::AlertDuplicate)?;
    let mut alerts = Vec::with_capacity(config.alerts.len());
    for (alert_idx, def) in config.alerts.iter().enumerate() {
        if def.num_buckets == 0 || def.trigger_if_sum_gt < 0 {
            return Err(ConfigError::AlertMalformed(def.id));
        }
        let metric_idx = *metric_index
            .get(&def.metric_id)
            .ok_or(ConfigError::AlertUnknownMetric(def.id))?;
        metric_producers[metric_idx]
            .common
            .alert_indices
            .push(alert_idx);
        alerts.push(AnomalyTracker::new(def));
    }

    // Alarms.
    let mut alarm_ids = HashSet::new();
    let mut alarms = Vec::with_capacity(config.alarms.len());
    for def in &config.alarms {
        if !alarm_ids.insert(def.id) {
            return Err(ConfigError::AlarmDuplicate(def.id));
        }
        if def.period_millis <= 0 {
            return Err(ConfigError::AlarmMalformed(def.id));
        }
        alarms.push(AlarmTracker::new(def, time_base_ns, current_ns));
    }

    let condition_cache: Vec<ConditionState> = (0..condition_trackers.len())
        .map(|i| condition::current_state(&condition_trackers, i))
        .collect();

    Ok(CompiledConfig {
        key,
        config,
        time_base_ns,
        matchers: matcher_trackers,
        matcher_index,
        tag_to_matchers,
        conditions: condition_trackers,
        condition_index,
        matcher_to_conditions,
        condition_cache,
        state_hashes,
        metrics: metric_producers,
        metric_index,
        matcher_to_metrics,
        condition_to_metrics,
        activation_to_metrics,
        deactivation_to_metrics,
        metrics_with_activation,
        no_report_metrics,
        alerts,
        alert_index,
        alarms,
    })
}

fn collect_simple_leaves(trackers: &[ConditionTracker], idx: usize, out: &mut Vec<usize>) {
    match &trackers[idx].kind {
        ConditionTrackerKind::Simple(_) => out.push(idx),
        ConditionTrackerKind::Combination(combo) => {
            for &child in &combo.children {
                collect_simple_leaves(trackers, child, out);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_metric(
    def: &MetricDefRef<'_>,
    config: &TelemetryConfig,
    matcher_trackers: &[MatcherTracker],
    matcher_index: &HashMap<i64, usize>,
    condition_trackers: &[ConditionTracker],
    condition_index: &HashMap<i64, usize>,
    state_atom_ids: &HashMap<i64, i32>,
    state_group_maps: &HashMap<i64, HashMap<i32, i64>>,
    activation_def: Option<&MetricActivation>,
    time_base_ns: i64,
    current_ns: i64,
) -> Result<MetricProducer, ConfigError> {
    let id = def.id();

    // Condition resolution, shared across kinds.
    let condition_id = def.condition();
    let condition_resolved = match condition_id {
        Some(cid) => Some(
            *condition_index
                .get(&cid)
                .ok_or(ConfigError::MetricUnknownCondition(id))?,
        ),
        None => None,
    };
    let condition_sliced =
        condition_resolved.is_some_and(|idx| condition_trackers[idx].is_sliced());
    let initial_condition = condition_resolved
        .map(|idx| condition::current_state(condition_trackers, idx))
        .unwrap_or(ConditionState::True);

    let mut links = Vec::with_capacity(def.links().len());
    for link in def.links() {
        let link_idx = *condition_index
            .get(&link.condition)
            .ok_or(ConfigError::MetricUnknownLinkCondition(id))?;
        links.push(CompiledLink {
            condition_id: link.condition,
            condition_index: link_idx,
            fields_in_what: link.fields_in_what.clone(),
            fields_in_condition: link.fields_in_condition.clone(),
        });
    }

    let dimensions_in_what = match def {
        MetricDefRef::Count(d) => d.dimensions_in_what.clone(),
        MetricDefRef::Duration(d) => d.dimensions_in_what.clone(),
        MetricDefRef::Gauge(d) => d.dimensions_in_what.clone(),
        MetricDefRef::Value(d) => d.dimensions_in_what.clone(),
        MetricDefRef::Kll(d) => d.dimensions_in_what.clone(),
        MetricDefRef::Event(_) => None,
    };

    let mut state_slices = Vec::with_capacity(def.slice_by_states().len());
    for state_id in def.slice_by_states() {
        let atom_id = *state_atom_ids
            .get(state_id)
            .ok_or(ConfigError::MetricUnknownState(id))?;
        if config.allowed_from_any_uid_atom_ids.contains(&atom_id) && dimensions_in_what.is_some()
        {
            return Err(ConfigError::MetricSlicedStateAtomAllowedFromAnyUid(id));
        }
        state_slices.push(StateSlice {
            state_id: *state_id,
            atom_id,
            group_map: state_group_maps.get(state_id).cloned().unwrap_or_default(),
        });
    }

    let bucket = match def {
        MetricDefRef::Event(d) => d.bucket,
        MetricDefRef::Count(d) => d.bucket,
        MetricDefRef::Duration(d) => d.bucket,
        MetricDefRef::Gauge(d) => d.bucket,
        MetricDefRef::Value(d) => d.bucket,
        MetricDefRef::Kll(d) => d.bucket,
    };
    let bucket_size_ns = i64::try_from(bucket.as_nanos()).unwrap_or(0);
    if bucket_size_ns <= 0 {
        return Err(ConfigError::BucketSizeInvalid(id));
    }

    let max_dims = match def {
        MetricDefRef::Count(d) => d.max_dimensions_per_bucket,
        MetricDefRef::Duration(d) => d.max_dimensions_per_bucket,
        MetricDefRef::Gauge(d) => d.max_dimensions_per_bucket,
        MetricDefRef::Value(d) => d.max_dimensions_per_bucket,
        MetricDefRef::Kll(d) => d.max_dimensions_per_bucket,
        MetricDefRef::Event(_) => None,
    };

    let activation = match activation_def {
        Some(ma) => {
            let mut activations = Vec::with_capacity(ma.event_activations.len());
            for ea in &ma.event_activations {
                let matcher_idx = *matcher_index
                    .get(&ea.atom_matcher_id)
                    .ok_or(ConfigError::MetricUnknownActivationMatcher(id))?;
                let deactivation_idx = match ea.deactivation_atom_matcher_id {
                    Some(d) => Some(
                        *matcher_index
                            .get(&d)
                            .ok_or(ConfigError::MetricUnknownActivationMatcher(id))?,
                    ),
                    None => None,
                };
                activations.push(Activation::new(
                    ea.atom_matcher_id,
                    matcher_idx,
                    ea.deactivation_atom_matcher_id,
                    deactivation_idx,
                    i64::try_from(ea.ttl.as_nanos()).unwrap_or(i64::MAX),
                    ea.activation_type,
                ));
            }
            ActivationState::new(activations)
        }
        None => ActivationState::default(),
    };

    // Validate `what` and build the variant.
    let variant = match def {
        MetricDefRef::Event(d) => {
            require_matcher(matcher_index, d.what, id)?;
            MetricVariant::Event(EventMetric::new())
        }
        MetricDefRef::Count(d) => {
            require_matcher(matcher_index, d.what, id)?;
            MetricVariant::Count(CountMetric::new())
        }
        MetricDefRef::Value(d) => {
            require_matcher(matcher_index, d.what, id)?;
            MetricVariant::Value(ValueMetric::new(
                d.value_field.clone(),
                d.use_diff,
                d.aggregation,
                d.skip_zero_diff_output,
            ))
        }
        MetricDefRef::Kll(d) => {
            require_matcher(matcher_index, d.what, id)?;
            MetricVariant::Kll(KllMetric::new(d.value_field.clone()))
        }
        MetricDefRef::Gauge(d) => {
            let what_idx = require_matcher(matcher_index, d.what, id)?;
            let trigger_index = match d.trigger_event_matcher {
                Some(t) => Some(require_matcher(matcher_index, t, id)?),
                None => None,
            };
            let pull_atom_id = if trigger_index.is_some() {
                let mut atoms = Vec::new();
                matchers::matcher_atom_ids(matcher_trackers, what_idx, &mut atoms);
                atoms.first().copied()
            } else {
                None
            };
            MetricVariant::Gauge(GaugeMetric::new(
                d.sampling,
                d.trigger_event_matcher,
                trigger_index,
                pull_atom_id,
            ))
        }
        MetricDefRef::Duration(d) => {
            let what_idx = *condition_index
                .get(&d.what)
                .ok_or(ConfigError::MetricUnknownWhat(id))?;
            let ConditionTrackerKind::Simple(simple) = &condition_trackers[what_idx].kind else {
                return Err(ConfigError::MetricUnknownWhat(id));
            };
            MetricVariant::Duration(DurationMetric::new(
                d.what,
                simple.start_index,
                simple.stop_index,
                simple.stop_all_index,
                simple.count_nesting,
                d.aggregation,
            ))
        }
    };

    // New producers open their bucket at the most recent boundary.
    let aligned_start = if current_ns > time_base_ns {
        time_base_ns + ((current_ns - time_base_ns) / bucket_size_ns) * bucket_size_ns
    } else {
        time_base_ns
    };

    let mut common = metrics::new_common(
        id,
        condition_id,
        condition_resolved,
        initial_condition,
        condition_sliced,
        links,
        state_slices,
        dimensions_in_what,
        bucket_size_ns,
        time_base_ns,
        max_dims,
        activation,
    );
    common.bucket_start_ns = aligned_start;

    Ok(MetricProducer::new(common, variant))
}

fn require_matcher(
    matcher_index: &HashMap<i64, usize>,
    matcher_id: i64,
    metric_id: i64,
) -> Result<usize, ConfigError> {
    matcher_index
        .get(&matcher_id)
        .copied()
        .ok_or(ConfigError::MetricUnknownWhat(metric_id))
}

// ---------------------------------------------------------------------------
// Preserved-tracker swap
// ---------------------------------------------------------------------------

/// Moves every preserved tracker from `old` into `fresh`, reusing the fresh
/// build's wiring. Infallible: every id involved was validated while
/// building `fresh` against the same definitions.
fn swap_preserved(mut fresh: CompiledConfig, old: CompiledConfig, diff: &UpdateDiff) -> CompiledConfig {
    let CompiledConfig {
        matchers: old_matchers,
        matcher_index: old_matcher_index,
        conditions: old_conditions,
        condition_index: old_condition_index,
        metrics: old_metrics,
        metric_index: old_metric_index,
        alerts: old_alerts,
        alert_index: old_alert_index,
        config: old_config,
        ..
    } = old;

    let old_matcher_defs: HashMap<i64, &AtomMatcherDef> =
        old_config.atom_matchers.iter().map(|m| (m.id, m)).collect();
    let old_condition_defs: HashMap<i64, &PredicateDef> =
        old_config.predicates.iter().map(|p| (p.id, p)).collect();

    // Matchers.
    let mut old_matchers: Vec<Option<MatcherTracker>> =
        old_matchers.into_iter().map(Some).collect();
    for (id, &new_idx) in &fresh.matcher_index {
        if diff.replaced_matchers.contains(id) || !old_matcher_defs.contains_key(id) {
            continue;
        }
        if let Some(&old_idx) = old_matcher_index.get(id) {
            if let Some(tracker) = old_matchers[old_idx].take() {
                fresh.matchers[new_idx] = tracker;
            }
        }
    }
    matchers::init_matchers(&mut fresh.matchers, &fresh.matcher_index)
        .expect("matcher graph validated during build");

    // Conditions.
    let mut old_conditions: Vec<Option<ConditionTracker>> =
        old_conditions.into_iter().map(Some).collect();
    for (id, &new_idx) in &fresh.condition_index {
        if diff.replaced_conditions.contains(id) || !old_condition_defs.contains_key(id) {
            continue;
        }
        if let Some(&old_idx) = old_condition_index.get(id) {
            if let Some(tracker) = old_conditions[old_idx].take() {
                fresh.conditions[new_idx] = tracker;
            }
        }
    }
    condition::init_conditions(
        &mut fresh.conditions,
        &fresh.condition_index,
        &fresh.matcher_index,
    )
    .expect("condition graph validated during build");

    // The cache now reflects live per-key state carried by the preserved
    // trackers; new combinations over them seed from it.
    fresh.condition_cache = (0..fresh.conditions.len())
        .map(|i| condition::current_state(&fresh.conditions, i))
        .collect();

    // Metrics: preserved producers keep their variant accumulation and
    // activation windows, and adopt the fresh wiring.
    let mut old_metrics: Vec<Option<MetricProducer>> = old_metrics.into_iter().map(Some).collect();
    let metric_index_snapshot: Vec<(i64, usize)> = fresh
        .metric_index
        .iter()
        .map(|(id, idx)| (*id, *idx))
        .collect();
    for (id, new_idx) in metric_index_snapshot {
        if diff.replaced_metrics.contains(&id) {
            continue;
        }
        let Some(&old_idx) = old_metric_index.get(&id) else {
            continue;
        };
        let Some(old_producer) = old_metrics[old_idx].take() else {
            continue;
        };
        let fresh_producer = &mut fresh.metrics[new_idx];

        let mut common = fresh_producer.common.clone();
        common.generation = old_producer.common.generation;
        common.bucket_start_ns = old_producer.common.bucket_start_ns;
        common.activation = old_producer.common.activation.clone();
        let matcher_index = &fresh.matcher_index;
        common
            .activation
            .rewire(|id| matcher_index.get(&id).copied());

        let mut variant = old_producer.variant;
        match (&mut variant, &fresh_producer.variant) {
            (MetricVariant::Duration(preserved), MetricVariant::Duration(rebuilt)) => {
                preserved.start_index = rebuilt.start_index;
                preserved.stop_index = rebuilt.stop_index;
                preserved.stop_all_index = rebuilt.stop_all_index;
            }
            (MetricVariant::Gauge(preserved), MetricVariant::Gauge(rebuilt)) => {
                preserved.trigger_index = rebuilt.trigger_index;
                preserved.pull_atom_id = rebuilt.pull_atom_id;
            }
            _ => {}
        }

        *fresh_producer = MetricProducer::new(common, variant);
    }

    // Every producer (new or preserved) starts from the reseeded cache.
    for producer in &mut fresh.metrics {
        if let Some(cond_idx) = producer.common.condition_index {
            producer.common.condition = fresh.condition_cache[cond_idx];
        }
    }

    // Alerts: preserved trackers carry their rolling windows.
    let old_alert_defs: HashMap<i64, &crate::spec::AlertDef> =
        old_config.alerts.iter().map(|a| (a.id, a)).collect();
    let mut old_alerts: Vec<Option<AnomalyTracker>> = old_alerts.into_iter().map(Some).collect();
    for (id, &new_idx) in &fresh.alert_index {
        if diff.replaced_alerts.contains(id) || !old_alert_defs.contains_key(id) {
            continue;
        }
        if let Some(&old_idx) = old_alert_index.get(id) {
            if let Some(tracker) = old_alerts[old_idx].take() {
                fresh.alerts[new_idx] = tracker;
            }
        }
    }

    debug!(config = %fresh.key, "preserved trackers carried into updated config");
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{
        CountMetricDef, MatcherCombination, SimpleAtomMatcher, StateDef,
    };
    use std::time::Duration;

    fn simple_matcher(id: i64, atom_id: i32) -> AtomMatcherDef {
        AtomMatcherDef {
            id,
            kind: MatcherKind::Simple(SimpleAtomMatcher {
                atom_id,
                field_value_matchers: vec![],
            }),
        }
    }

    fn combination_matcher(
        id: i64,
        operation: crate::spec::LogicalOperation,
        children: Vec<i64>,
    ) -> AtomMatcherDef {
        AtomMatcherDef {
            id,
            kind: MatcherKind::Combination(MatcherCombination {
                operation,
                children,
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

    const KEY: ConfigKey = ConfigKey { uid: 123, id: 456 };

    #[test]
    fn test_matcher_update_classification() {
        // S1(atom 10), S2(atom 11), C3 = S1 OR S2. Update changes S2's
        // atom to 111 and adds S4 and C5 = S2 AND S4.
        use crate::spec::LogicalOperation;
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            combination_matcher(3, LogicalOperation::Or, vec![1, 2]),
        ];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");

        let mut new_config = config;
        new_config.atom_matchers[1] = simple_matcher(2, 111);
        new_config
            .atom_matchers
            .push(simple_matcher(4, 13));
        new_config.atom_matchers.push(combination_matcher(
            5,
            LogicalOperation::And,
            vec![2, 4],
        ));

        let diff = compute_diff(&new_config, &old).expect("diff");
        assert_eq!(
            diff.replaced_matchers,
            HashSet::from([2i64, 3i64]),
            "S2 and C3 replaced; S4/C5 are new, S1 preserved"
        );
    }

    #[test]
    fn test_preserved_matcher_keeps_generation() {
        use crate::spec::LogicalOperation;
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            combination_matcher(3, LogicalOperation::Or, vec![1, 2]),
        ];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");
        let old_gen_s1 = old.matchers[old.matcher_index[&1]].generation;
        let old_gen_s2 = old.matchers[old.matcher_index[&2]].generation;

        let mut new_config = config;
        new_config.atom_matchers[1] = simple_matcher(2, 111);
        let (updated, _) = update(KEY, new_config, old, 0).expect("update");

        assert_eq!(
            updated.matchers[updated.matcher_index[&1]].generation,
            old_gen_s1
        );
        assert_ne!(
            updated.matchers[updated.matcher_index[&2]].generation,
            old_gen_s2
        );
    }

    #[test]
    fn test_update_reorders_and_preserves() {
        use crate::spec::LogicalOperation;
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![
            simple_matcher(1, 10),
            simple_matcher(2, 11),
            combination_matcher(3, LogicalOperation::Not, vec![1]),
        ];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");
        let old_gen_c3 = old.matchers[old.matcher_index[&3]].generation;

        // Same definitions, different order: everything preserved, indices
        // remapped.
        let mut new_config = TelemetryConfig::new(1);
        new_config.atom_matchers = vec![
            combination_matcher(3, LogicalOperation::Not, vec![1]),
            simple_matcher(1, 10),
            simple_matcher(2, 11),
        ];
        let (updated, diff) = update(KEY, new_config, old, 0).expect("update");
        assert!(diff.replaced_matchers.is_empty());
        assert_eq!(updated.matcher_index[&3], 0);
        assert_eq!(
            updated.matchers[0].generation, old_gen_c3,
            "preserved combination keeps identity after reordering"
        );
        // Child indices follow the new arena layout.
        match &updated.matchers[0].kind {
            crate::matchers::MatcherTrackerKind::Combination { children, .. } => {
                assert_eq!(children, &vec![updated.matcher_index[&1]]);
            }
            _ => panic!("expected combination"),
        }
    }

    #[test]
    fn test_metric_replaced_when_what_replaced() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");

        let mut new_config = config;
        new_config.atom_matchers[0] = simple_matcher(1, 11);
        let diff = compute_diff(&new_config, &old).expect("diff");
        assert!(diff.replaced_matchers.contains(&1));
        assert!(diff.replaced_metrics.contains(&100));
    }

    #[test]
    fn test_metric_preserved_when_nothing_changed() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");
        let old_gen = old.metrics[0].generation();

        let (updated, diff) = update(KEY, config, old, 0).expect("update");
        assert!(diff.replaced_metrics.is_empty());
        assert_eq!(updated.metrics[0].generation(), old_gen);
    }

    #[test]
    fn test_state_hash_diff() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.states = vec![
            StateDef {
                id: 50,
                atom_id: 29,
                groups: vec![],
            },
            StateDef {
                id: 51,
                atom_id: 47,
                groups: vec![],
            },
        ];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");

        let mut new_config = config;
        new_config.states[0].atom_id = 30;
        let diff = compute_diff(&new_config, &old).expect("diff");
        assert_eq!(diff.replaced_states, HashSet::from([50i64]));
    }

    #[test]
    fn test_duplicate_matcher_rejected() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10), simple_matcher(1, 11)];
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("duplicate"),
            ConfigError::MatcherDuplicate(1)
        );
    }

    #[test]
    fn test_unknown_what_rejected() {
        let mut config = TelemetryConfig::new(1);
        config.count_metrics = vec![count_metric(100, 999)];
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("unknown what"),
            ConfigError::MetricUnknownWhat(100)
        );
    }

    #[test]
    fn test_no_report_metric_must_exist() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        config.no_report_metrics = vec![12345];
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("missing no-report target"),
            ConfigError::NoReportMetricNotFound(12345)
        );
    }

    #[test]
    fn test_zero_bucket_rejected() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        let mut metric = count_metric(100, 1);
        metric.bucket = Duration::from_secs(0);
        config.count_metrics = vec![metric];
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("zero bucket"),
            ConfigError::BucketSizeInvalid(100)
        );
    }

    #[test]
    fn test_restricted_delegate_rejected_for_non_event() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        config.restricted_metrics_delegate = Some("com.example.delegate".to_string());
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("restricted"),
            ConfigError::RestrictedMetricNotSupported(100)
        );
    }

    #[test]
    fn test_multiple_activations_rejected() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        let activation = MetricActivation {
            metric_id: 100,
            event_activations: vec![crate::spec::EventActivation {
                atom_matcher_id: 1,
                ttl: Duration::from_secs(60),
                activation_type: crate::spec::ActivationType::Immediate,
                deactivation_atom_matcher_id: None,
            }],
        };
        config.metric_activations = vec![activation.clone(), activation];
        assert_eq!(
            compile(KEY, config, 0, 0).expect_err("multiple activations"),
            ConfigError::MetricHasMultipleActivations(100)
        );
    }

    #[test]
    fn test_failed_update_leaves_old_running() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");
        let old_gen = old.metrics[0].generation();

        let mut bad = config;
        bad.count_metrics.push(count_metric(101, 999));
        let (err, recovered) = update(KEY, bad, old, 0).expect_err("invalid update");
        assert_eq!(err, ConfigError::MetricUnknownWhat(101));
        assert_eq!(recovered.metrics[0].generation(), old_gen);
        assert_eq!(recovered.metrics.len(), 1);
    }

    #[test]
    fn test_alert_diff_follows_metric() {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![simple_matcher(1, 10)];
        config.count_metrics = vec![count_metric(100, 1)];
        config.alerts = vec![crate::spec::AlertDef {
            id: 7,
            metric_id: 100,
            num_buckets: 2,
            trigger_if_sum_gt: 5,
            refractory_period_secs: 10,
        }];
        let old = compile(KEY, config.clone(), 0, 0).expect("compile");

        // Metric definition changes, dragging the alert with it.
        let mut new_config = config.clone();
        new_config.count_metrics[0].bucket = Duration::from_secs(3600);
        let diff = compute_diff(&new_config, &old).expect("diff");
        assert!(diff.replaced_metrics.contains(&100));
        assert!(diff.replaced_alerts.contains(&7));

        // Alert definition change alone also replaces it.
        let mut alert_changed = config;
        alert_changed.alerts[0].num_buckets = 5;
        let diff = compute_diff(&alert_changed, &old).expect("diff");
        assert!(diff.replaced_metrics.is_empty());
        assert!(diff.replaced_alerts.contains(&7));
    }

    #[test]
    fn test_alarm_next_fire_recomputed_on_update() {
        const SEC: i64 = 1_000_000_000;
        let base = 1000 * SEC;
        let mut config = TelemetryConfig::new(1);
        config.alarms = vec![
            crate::spec::AlarmDef {
                id: 1,
                offset_millis: 1_000,
                period_millis: 50_000,
            },
            crate::spec::AlarmDef {
                id: 2,
                offset_millis: 10_000,
                period_millis: 5_000_000,
            },
        ];
        let old = compile(KEY, config.clone(), base, base).expect("compile");
        assert_eq!(old.alarms[0].next_fire_sec(), 1001);
        assert_eq!(old.alarms[1].next_fire_sec(), 1010);

        // Two seconds later the first offset has elapsed.
        let (updated, _) = update(KEY, config, old, base + 2 * SEC).expect("update");
        assert_eq!(updated.alarms[0].next_fire_sec(), 1001 + 50);
        assert_eq!(updated.alarms[1].next_fire_sec(), 1010);
    }
}
