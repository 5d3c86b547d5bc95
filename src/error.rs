use thiserror::Error;

/// Structured reason a configuration failed to install or update.
///
/// The first error encountered aborts the whole install; the previously
/// running configuration, if any, is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("duplicate matcher id {0}")]
    MatcherDuplicate(i64),
    #[error("matcher graph cycle through matcher {0}")]
    MatcherCycle(i64),
    #[error("malformed matcher {0}")]
    MatcherMalformed(i64),
    #[error("matcher {0} references an unknown child matcher")]
    MatcherChildNotFound(i64),
    #[error("duplicate predicate id {0}")]
    ConditionDuplicate(i64),
    #[error("predicate graph cycle through predicate {0}")]
    ConditionCycle(i64),
    #[error("combination predicate {0} mixes sliced children illegally")]
    ConditionInvalidCombination(i64),
    #[error("predicate {0} references an unknown matcher")]
    ConditionMissingMatcher(i64),
    #[error("predicate {0} references an unknown child predicate")]
    ConditionChildNotFound(i64),
    #[error("duplicate state id {0}")]
    StateDuplicate(i64),
    #[error("duplicate metric id {0}")]
    MetricDuplicate(i64),
    #[error("metric {0} references an unknown what matcher")]
    MetricUnknownWhat(i64),
    #[error("metric {0} references an unknown condition")]
    MetricUnknownCondition(i64),
    #[error("metric {0} references an unknown state")]
    MetricUnknownState(i64),
    #[error("metric {0} references an unknown link condition")]
    MetricUnknownLinkCondition(i64),
    #[error("metric {0} has multiple activations for the same matcher")]
    MetricHasMultipleActivations(i64),
    #[error("activation for metric {0} references an unknown matcher")]
    MetricUnknownActivationMatcher(i64),
    #[error("activation references unknown metric {0}")]
    ActivationUnknownMetric(i64),
    #[error("no-report metric {0} does not exist")]
    NoReportMetricNotFound(i64),
    #[error("metric {0} slices by a state atom allowed from any uid while exposing dimensions")]
    MetricSlicedStateAtomAllowedFromAnyUid(i64),
    #[error("restricted metric delegation is not supported (metric {0})")]
    RestrictedMetricNotSupported(i64),
    #[error("metric {0} has an invalid bucket size")]
    BucketSizeInvalid(i64),
    #[error("alert {0} references an unknown metric")]
    AlertUnknownMetric(i64),
    #[error("duplicate alert id {0}")]
    AlertDuplicate(i64),
    #[error("alert {0} has an invalid trigger or window")]
    AlertMalformed(i64),
    #[error("duplicate alarm id {0}")]
    AlarmDuplicate(i64),
    #[error("alarm {0} has an invalid period")]
    AlarmMalformed(i64),
    #[error("too many matchers: {0}")]
    TooManyMatchers(usize),
    #[error("too many predicates: {0}")]
    TooManyConditions(usize),
    #[error("too many metrics: {0}")]
    TooManyMetrics(usize),
    #[error("too many alerts: {0}")]
    TooManyAlerts(usize),
    #[error("too many alarms: {0}")]
    TooManyAlarms(usize),
}
