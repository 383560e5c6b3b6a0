use conduit_model::EngineConfig;
use thiserror::Error;

/// Shortest job deadline the engine accepts.
pub const MIN_JOB_TIMEOUT_SECS: u64 = 5 * 60;
/// Shortest retention sweep cadence the engine accepts.
pub const MIN_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("pool.pool_size must be greater than zero")]
    EmptyPool,
    #[error("pool.queue_capacity must be greater than zero")]
    EmptyQueue,
    #[error("operations.{field} is {actual}s; it must be at least {minimum}s")]
    IntervalTooShort {
        field: &'static str,
        actual: u64,
        minimum: u64,
    },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Rejects configurations the engine cannot run with and collects warnings
/// for ones it can run with but probably should not.
pub fn apply_guard_rails(
    config: &EngineConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let ops = &config.operations;

    if config.pool.pool_size == 0 {
        return Err(ConfigGuardRailError::EmptyPool);
    }
    if config.pool.queue_capacity == 0 {
        return Err(ConfigGuardRailError::EmptyQueue);
    }
    at_least("job_timeout_secs", ops.job_timeout_secs, MIN_JOB_TIMEOUT_SECS)?;
    at_least(
        "cleanup_interval_secs",
        ops.cleanup_interval_secs,
        MIN_CLEANUP_INTERVAL_SECS,
    )?;
    non_zero("operations.reschedule_interval_secs", ops.reschedule_interval_secs)?;
    non_zero("cascade.polling_interval_ms", config.cascade.polling_interval_ms)?;

    let mut warnings = ConfigWarnings::default();

    if ops.orphan_mitigation_grace_secs < ops.reschedule_interval_secs {
        warnings.push_with_hint(
            "orphan mitigation grace is shorter than the reschedule interval; failed provisions will not be cleaned up",
            "Raise operations.orphan_mitigation_grace_secs above operations.reschedule_interval_secs",
        );
    }

    if ops.max_polling_duration_secs < ops.reschedule_interval_secs {
        warnings.push_with_hint(
            "max polling duration is shorter than the reschedule interval; asynchronous backend actions will time out before their first poll",
            "Raise operations.max_polling_duration_secs",
        );
    }

    if ops.notification_timeout_secs == 0 {
        warnings.push(
            "notification timeout is zero; synchronous callers will time out immediately",
        );
    }

    if config.cascade.tenant_label_key.trim().is_empty() {
        warnings.push_with_hint(
            "tenant label key is empty; tenant deletes will match no resources",
            "Set cascade.tenant_label_key",
        );
    }

    Ok(warnings)
}

fn at_least(
    field: &'static str,
    actual: u64,
    minimum: u64,
) -> Result<(), ConfigGuardRailError> {
    if actual < minimum {
        return Err(ConfigGuardRailError::IntervalTooShort {
            field,
            actual,
            minimum,
        });
    }
    Ok(())
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::ZeroInterval { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&EngineConfig::default()).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn empty_pool_is_rejected() {
        let mut config = EngineConfig::default();
        config.pool.pool_size = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::EmptyPool
        );
    }

    #[test]
    fn short_job_timeout_is_rejected() {
        let mut config = EngineConfig::default();
        config.operations.job_timeout_secs = MIN_JOB_TIMEOUT_SECS - 1;
        let err = apply_guard_rails(&config).unwrap_err();
        assert_eq!(
            err,
            ConfigGuardRailError::IntervalTooShort {
                field: "job_timeout_secs",
                actual: 299,
                minimum: 300,
            }
        );
    }

    #[test]
    fn boundary_values_are_accepted() {
        let mut config = EngineConfig::default();
        config.operations.job_timeout_secs = MIN_JOB_TIMEOUT_SECS;
        config.operations.cleanup_interval_secs = MIN_CLEANUP_INTERVAL_SECS;
        assert!(apply_guard_rails(&config).is_ok());
    }

    #[test]
    fn short_cleanup_interval_is_rejected() {
        let mut config = EngineConfig::default();
        config.operations.cleanup_interval_secs = 60;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::IntervalTooShort {
                field: "cleanup_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn short_mitigation_grace_only_warns() {
        let mut config = EngineConfig::default();
        config.operations.orphan_mitigation_grace_secs = 1;
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }
}
