//! Per-call context: configuration plus an injected clock.

use crate::config::{Config, NamespaceConfig};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything an operation needs besides the store.
#[derive(Clone)]
pub struct Context {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            clock,
        }
    }

    /// Context on the wall clock.
    pub fn system(config: Config) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Configuration of namespace `ns`.
    pub fn namespace(&self, ns: &str) -> Result<&NamespaceConfig> {
        self.config
            .namespace(ns)
            .ok_or_else(|| Error::Config(format!("unknown namespace: {}", ns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{NS, t0, test_config};

    #[test]
    fn test_fixed_clock_advances() {
        let clock = Arc::new(FixedClock::new(t0()));
        let ctx = Context::new(test_config(), clock.clone());
        assert_eq!(ctx.now(), t0());
        clock.advance(Duration::hours(2));
        assert_eq!(ctx.now(), t0() + Duration::hours(2));
    }

    #[test]
    fn test_unknown_namespace_is_config_error() {
        let ctx = Context::system(test_config());
        assert!(ctx.namespace(NS).is_ok());
        assert!(matches!(ctx.namespace("nope"), Err(Error::Config(_))));
    }
}
