use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::MetricsConfig;

/// Everything an evaluation needs besides the entity: the backend, a clock
/// and the runtime configuration.
pub struct MetricsContext<'a, B> {
    backend: &'a B,
    clock: Arc<dyn Clock>,
    config: MetricsConfig,
}

impl<'a, B> MetricsContext<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            config: MetricsConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: MetricsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}
