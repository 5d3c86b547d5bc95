//! Engine core: the event dispatcher and the command surface.
//!
//! One mutex serializes everything on the evaluation path; it doubles as
//! the evaluation scheduler. Per event the pipeline is strict: matchers,
//! then conditions, then states, then metric producers in ascending index
//! order, then alerts observing bucket closure. The UidMap lives outside
//! this lock; package callbacks re-enter through the listener after the
//! map lock is released.

pub mod service;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::anomaly::AlarmMonitor;
use crate::compiler::{self, CompiledConfig, UpdateDiff};
use crate::condition::{self, ConditionState};
use crate::error::ConfigError;
use crate::event::Event;
use crate::matchers::{self, MatchState};
use crate::metrics::EvalContext;
use crate::puller::PullerManager;
use crate::report::{AlertReport, ConfigReport, MetricReport};
use crate::spec::{ConfigKey, TelemetryConfig};
use crate::state::StateManager;
use crate::stats::{GuardrailSnapshot, GuardrailStats};
use crate::uidmap::{ReportOptions, UidMap, UidMapListener};

const NS_PER_SEC: i64 = 1_000_000_000;

struct RunningConfig {
    compiled: CompiledConfig,
    /// Wake instant registered with the alarm monitor.
    alarm_token: u64,
}

struct EngineInner {
    configs: BTreeMap<ConfigKey, RunningConfig>,
    state_mgr: StateManager,
    pullers: PullerManager,
    alarm_monitor: AlarmMonitor,
    time_base_ns: i64,
}

/// The aggregation engine. Cheap to share; all mutation goes through the
/// internal lock.
pub struct Engine {
    inner: Mutex<EngineInner>,
    uid_map: Arc<UidMap>,
    stats: Arc<GuardrailStats>,
}

impl Engine {
    pub fn new(time_base_ns: i64) -> Self {
        Self {
            inner: Mutex::new(EngineInner {
                configs: BTreeMap::new(),
                state_mgr: StateManager::new(),
                pullers: PullerManager::new(),
                alarm_monitor: AlarmMonitor::new(),
                time_base_ns,
            }),
            uid_map: Arc::new(UidMap::new()),
            stats: Arc::new(GuardrailStats::new()),
        }
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn stats(&self) -> &Arc<GuardrailStats> {
        &self.stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers the engine as the uid-map listener. Call once after
    /// wrapping the engine in an `Arc`; the map holds only a weak handle
    /// onto the same allocation, so late callbacks after engine teardown
    /// degrade to no-ops.
    pub fn attach_uid_map_listener(self: &Arc<Self>) {
        let listener: Arc<dyn UidMapListener> = Arc::clone(self) as Arc<dyn UidMapListener>;
        self.uid_map.set_listener(Arc::downgrade(&listener));
    }

    pub fn register_puller(&self, atom_id: i32, puller: Box<dyn crate::puller::Puller>) {
        self.lock().pullers.register(atom_id, puller);
    }

    /// Installs or replaces a configuration atomically.
    pub fn set_config(
        &self,
        key: ConfigKey,
        config: TelemetryConfig,
        now_ns: i64,
    ) -> Result<UpdateDiff, ConfigError> {
        let mut inner = self.lock();
        let time_base_ns = inner.time_base_ns;

        let (compiled, diff) = match inner.configs.remove(&key) {
            Some(running) => {
                let old_atoms = running.compiled.state_atom_refs();
                inner.alarm_monitor.unregister(running.alarm_token);
                match compiler::update(key, config, running.compiled, now_ns) {
                    Ok((compiled, diff)) => {
                        // Register the new references before releasing the
                        // old ones: state trackers shared across the update
                        // must not lose their maps in between.
                        for atom in compiled.state_atom_refs() {
                            inner.state_mgr.register(atom);
                        }
                        for atom in old_atoms {
                            inner.state_mgr.unregister(atom);
                        }
                        (compiled, diff)
                    }
                    Err((e, old)) => {
                        // Put the untouched old config back.
                        let token = inner.alarm_monitor.register(wake_sec(&old));
                        inner.configs.insert(
                            key,
                            RunningConfig {
                                compiled: old,
                                alarm_token: token,
                            },
                        );
                        warn!(config = %key, error = %e, "config update rejected");
                        return Err(e);
                    }
                }
            }
            None => match compiler::compile(key, config, time_base_ns, now_ns) {
                Ok(compiled) => {
                    for atom in compiled.state_atom_refs() {
                        inner.state_mgr.register(atom);
                    }
                    (compiled, UpdateDiff::default())
                }
                Err(e) => {
                    warn!(config = %key, error = %e, "config install rejected");
                    return Err(e);
                }
            },
        };

        let token = inner.alarm_monitor.register(wake_sec(&compiled));
        inner.configs.insert(
            key,
            RunningConfig {
                compiled,
                alarm_token: token,
            },
        );
        drop(inner);

        self.uid_map.on_config_updated(key);
        info!(config = %key, "config installed");
        Ok(diff)
    }

    pub fn remove_config(&self, key: ConfigKey) {
        let mut inner = self.lock();
        if let Some(running) = inner.configs.remove(&key) {
            for atom in running.compiled.state_atom_refs() {
                inner.state_mgr.unregister(atom);
            }
            inner.alarm_monitor.unregister(running.alarm_token);
            drop(inner);
            self.uid_map.on_config_removed(key);
            info!(config = %key, "config removed");
        }
    }

    pub fn config_count(&self) -> usize {
        self.lock().configs.len()
    }

    /// Primary hot path: dispatches one event through every installed
    /// configuration.
    pub fn on_event(&self, mut event: Event) {
        self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
        event.uid = self.uid_map.host_uid_or_self(event.uid);

        let mut inner = self.lock();
        let EngineInner {
            configs,
            state_mgr,
            pullers,
            alarm_monitor,
            ..
        } = &mut *inner;

        // State step: apply the event, remembering old values so metrics
        // observe the pre-event states.
        let state_changes = state_mgr.on_event(&event);

        let mut any_interested = false;
        for running in configs.values_mut() {
            let compiled = &mut running.compiled;

            // Forward state transitions to the metrics slicing on them,
            // independent of matcher interest.
            if !state_changes.is_empty() {
                for producer in &mut compiled.metrics {
                    for change in &state_changes {
                        producer.on_state_changed(change);
                    }
                }
            }

            if !compiled.interested_in_atom(event.atom_id) {
                continue;
            }
            any_interested = true;

            // 1. Matchers.
            let matcher_results = matchers::evaluate_all(&compiled.matchers, &event, &self.uid_map);
            let fired: Vec<usize> = matcher_results
                .iter()
                .enumerate()
                .filter(|(_, r)| r.matched())
                .map(|(i, _)| i)
                .collect();
            if fired.is_empty() {
                continue;
            }

            // 2. Conditions.
            let consumes_conditions = fired
                .iter()
                .any(|m| compiled.matcher_to_conditions.contains_key(m));
            let (condition_cache, condition_changed, _sliced_changes) = if consumes_conditions {
                condition::evaluate_all(&mut compiled.conditions, &event, &matcher_results)
            } else {
                (
                    compiled.condition_cache.clone(),
                    vec![false; compiled.conditions.len()],
                    Vec::new(),
                )
            };

            let CompiledConfig {
                conditions,
                condition_cache: stored_cache,
                metrics,
                alerts,
                matcher_to_metrics,
                condition_to_metrics,
                activation_to_metrics,
                deactivation_to_metrics,
                ..
            } = compiled;
            let conditions = &*conditions;

            // Keep the seeded cache in sync for future installs.
            if consumes_conditions {
                stored_cache.clone_from(&condition_cache);
            }

            let ctx = EvalContext {
                conditions,
                state_mgr,
                state_changes: &state_changes,
                pullers,
                stats: self.stats.as_ref(),
            };

            // Condition listeners, ascending metric order per change.
            for (cond_idx, changed) in condition_changed.iter().enumerate() {
                if !*changed {
                    continue;
                }
                let Some(metric_indices) = condition_to_metrics.get(&cond_idx) else {
                    continue;
                };
                let sliced = conditions[cond_idx].is_sliced();
                for &metric_idx in metric_indices {
                    if sliced {
                        metrics[metric_idx].on_sliced_condition_may_change(
                            event.elapsed_ts_ns,
                            &ctx,
                            alerts,
                        );
                    } else {
                        metrics[metric_idx].on_condition_changed(
                            condition_cache[cond_idx],
                            event.elapsed_ts_ns,
                            alerts,
                        );
                    }
                }
            }

            // Activation gates ahead of metric delivery, so an activating
            // event can itself be recorded.
            for &matcher_idx in &fired {
                if let Some(metric_indices) = activation_to_metrics.get(&matcher_idx) {
                    for &metric_idx in metric_indices {
                        metrics[metric_idx]
                            .common
                            .activation
                            .on_activation_matcher(matcher_idx, event.elapsed_ts_ns);
                    }
                }
                if let Some(metric_indices) = deactivation_to_metrics.get(&matcher_idx) {
                    for &metric_idx in metric_indices {
                        metrics[metric_idx]
                            .common
                            .activation
                            .on_deactivation_matcher(matcher_idx);
                    }
                }
            }

            // 4. Metric delivery in ascending metric index order.
            let mut deliveries: Vec<(usize, usize)> = fired
                .iter()
                .flat_map(|&matcher_idx| {
                    matcher_to_metrics
                        .get(&matcher_idx)
                        .into_iter()
                        .flatten()
                        .map(move |&metric_idx| (metric_idx, matcher_idx))
                })
                .collect();
            deliveries.sort_unstable();
            for (metric_idx, matcher_idx) in deliveries {
                metrics[metric_idx].on_matched_event(matcher_idx, &event, &ctx, alerts);
            }

            alarm_monitor.reschedule(running.alarm_token, wake_sec(&running.compiled));
        }

        if !any_interested {
            self.stats.events_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Injects a batch of pulled events through the normal dispatch path.
    pub fn inject_pulled_events(&self, events: Vec<Event>) {
        for event in events {
            self.on_event(event);
        }
    }

    /// Earliest instant (seconds) anything wants to wake for: a periodic
    /// alarm or a predicted anomaly crossing.
    pub fn next_wakeup_sec(&self) -> Option<i64> {
        self.lock().alarm_monitor.next_fire_sec().filter(|s| *s < i64::MAX)
    }

    /// Advances periodic alarms and fires due predicted anomalies.
    pub fn on_alarm_tick(&self, now_ns: i64) {
        let now_sec = now_ns / NS_PER_SEC;
        let mut inner = self.lock();
        let EngineInner {
            configs,
            alarm_monitor,
            ..
        } = &mut *inner;
        for running in configs.values_mut() {
            for alarm in &mut running.compiled.alarms {
                alarm.on_alarm_fired(now_sec);
            }
            for alert in &mut running.compiled.alerts {
                alert.fire_pending(now_ns);
            }
            alarm_monitor.reschedule(running.alarm_token, wake_sec(&running.compiled));
        }
    }

    /// Boot notification: armed on-boot activations open now.
    pub fn on_boot(&self, now_ns: i64) {
        let mut inner = self.lock();
        for running in inner.configs.values_mut() {
            for producer in &mut running.compiled.metrics {
                producer.common.activation.on_boot(now_ns);
            }
        }
    }

    /// Report without resetting: closed buckets only, open buckets and
    /// tracker state untouched.
    pub fn flush(&self, key: ConfigKey, now_ns: i64) -> Option<ConfigReport> {
        let inner = self.lock();
        let running = inner.configs.get(&key)?;
        let compiled = &running.compiled;

        let metrics = compiled
            .metrics
            .iter()
            .filter(|m| !compiled.no_report_metrics.contains(&m.id()))
            .map(|m| MetricReport::from_variant(m.id(), m.peek_report()))
            .collect();
        let alerts = alert_reports(compiled);
        drop(inner);

        Some(self.assemble_report(key, now_ns, metrics, alerts))
    }

    /// Report and reset: the open bucket closes at `now_ns` as a partial
    /// bucket and all closed buckets drain.
    pub fn flush_and_clear(&self, key: ConfigKey, now_ns: i64) -> Option<ConfigReport> {
        let mut inner = self.lock();
        let running = inner.configs.get_mut(&key)?;

        let CompiledConfig {
            metrics: producers,
            alerts: alert_trackers,
            no_report_metrics,
            ..
        } = &mut running.compiled;

        let mut metrics = Vec::with_capacity(producers.len());
        for producer in producers.iter_mut() {
            let report = producer.drain_report(now_ns, alert_trackers);
            if !no_report_metrics.contains(&producer.id()) {
                metrics.push(MetricReport::from_variant(producer.id(), report));
            }
        }
        let alerts = alert_reports(&running.compiled);
        drop(inner);

        Some(self.assemble_report(key, now_ns, metrics, alerts))
    }

    fn assemble_report(
        &self,
        key: ConfigKey,
        now_ns: i64,
        metrics: Vec<MetricReport>,
        alerts: Vec<AlertReport>,
    ) -> ConfigReport {
        let uid_map = self.uid_map.append_report(
            now_ns,
            key,
            &ReportOptions {
                include_version_strings: true,
                include_installer: true,
                certificate_hash_bytes: 8,
                hash_strings: false,
            },
        );
        debug!(config = %key, metrics = metrics.len(), "report assembled");
        ConfigReport {
            key,
            timestamp_ns: now_ns,
            metrics,
            alerts,
            uid_map,
            runtime: self.stats_snapshot(),
        }
    }

    /// Guardrail counters plus the anomaly total aggregated from the live
    /// alert trackers.
    pub fn stats_snapshot(&self) -> GuardrailSnapshot {
        let mut snap = self.stats.snapshot();
        let inner = self.lock();
        snap.anomalies_declared = inner
            .configs
            .values()
            .flat_map(|r| r.compiled.alerts.iter())
            .map(|a| a.total_fired())
            .sum();
        snap
    }

    /// Test and diagnostics access: current value of a condition by id.
    pub fn condition_state(&self, key: ConfigKey, predicate_id: i64) -> Option<ConditionState> {
        let inner = self.lock();
        let compiled = &inner.configs.get(&key)?.compiled;
        let idx = *compiled.condition_index.get(&predicate_id)?;
        Some(condition::current_state(&compiled.conditions, idx))
    }

    /// Test and diagnostics access: whether a matcher fires for an event.
    pub fn probe_matchers(&self, key: ConfigKey, event: &Event) -> Option<Vec<MatchState>> {
        let inner = self.lock();
        let compiled = &inner.configs.get(&key)?.compiled;
        Some(matchers::evaluate_all(
            &compiled.matchers,
            event,
            &self.uid_map,
        ))
    }
}

fn alert_reports(compiled: &CompiledConfig) -> Vec<AlertReport> {
    compiled
        .alerts
        .iter()
        .map(|a| AlertReport {
            alert_id: a.id,
            metric_id: a.metric_id,
            total_fired: a.total_fired(),
            firings: a.firings().to_vec(),
        })
        .collect()
}

/// Earliest wake instant for one config, seconds; `i64::MAX` when idle.
fn wake_sec(compiled: &CompiledConfig) -> i64 {
    let alarm = compiled.next_alarm_sec().unwrap_or(i64::MAX);
    let anomaly = compiled
        .next_predicted_anomaly_ns()
        .map(|ns| ns.div_euclid(NS_PER_SEC))
        .unwrap_or(i64::MAX);
    alarm.min(anomaly)
}

impl UidMapListener for Engine {
    fn on_uid_map_received(&self, timestamp_ns: i64) {
        debug!(timestamp_ns, "uid map snapshot received");
    }

    fn on_app_upgrade(&self, timestamp_ns: i64, package: &str, uid: i32, version: i64) {
        self.stats.app_upgrades.fetch_add(1, Ordering::Relaxed);
        info!(timestamp_ns, package, uid, version, "app upgraded");
    }

    fn on_app_removed(&self, timestamp_ns: i64, package: &str, uid: i32) {
        debug!(timestamp_ns, package, uid, "app removed");
    }
}
