//! Backend selection from configuration.

use std::sync::Arc;

use tracing::info;

use super::backend::Limiter;
use super::distributed::DistributedLimiter;
use super::limiter::StandaloneLimiter;
use crate::config::{LimiterConfig, Mode};
use crate::error::{LimiterError, Result};
use crate::store::ScheduleStore;

/// Build the limiter named by `config.mode`.
///
/// Misconfiguration fails here rather than on the first request: the config is
/// validated, distributed mode without a store is rejected, and standalone mode
/// outside a tokio runtime is rejected.
pub fn new_limiter(
    config: &LimiterConfig,
    store: Option<Arc<dyn ScheduleStore>>,
) -> Result<Arc<dyn Limiter>> {
    config.validate()?;

    let limiter: Arc<dyn Limiter> = match config.mode {
        Mode::Standalone => Arc::new(StandaloneLimiter::new(&config.standalone)?),
        Mode::Distributed => {
            let store = store.ok_or_else(|| {
                LimiterError::Config("distributed mode requires a connected store".into())
            })?;
            Arc::new(DistributedLimiter::new(&config.distributed, store))
        }
    };

    info!(mode = %config.mode, "Rate limiter initialized");
    Ok(limiter)
}
