use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::debug;

use crate::{
    config::GateConfig,
    error::{PipelineError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Metadata,
    Download,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Metadata => f.write_str("metadata"),
            ResourceClass::Download => f.write_str("download"),
        }
    }
}

/// Slot in the fetch gate. Dropping it frees the slot, whatever happened to the fetch.
#[derive(Debug)]
pub struct FetchPermit {
    class: ResourceClass,
    _permit: OwnedSemaphorePermit,
}

impl FetchPermit {
    pub fn class(&self) -> ResourceClass {
        self.class
    }
}

struct ProviderState {
    next_slot: Instant,
    window_start: Instant,
    window_count: u32,
}

/// Bounds concurrent external fetches per resource class and spaces requests per provider.
pub struct FetchGate {
    metadata: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    config: GateConfig,
    providers: Mutex<HashMap<String, ProviderState>>,
}

impl FetchGate {
    pub fn new(config: GateConfig) -> Self {
        debug!(
            max_concurrent_downloads = config.max_concurrent_downloads,
            max_concurrent_metadata = config.max_concurrent_metadata,
            "FetchGate initialized"
        );
        Self {
            metadata: Arc::new(Semaphore::new(config.max_concurrent_metadata)),
            downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config,
            providers: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, class: ResourceClass) -> &Arc<Semaphore> {
        match class {
            ResourceClass::Metadata => &self.metadata,
            ResourceClass::Download => &self.downloads,
        }
    }

    pub fn available(&self, class: ResourceClass) -> usize {
        self.semaphore(class).available_permits()
    }

    /// Waits for a free slot of `class`, then for the provider's next request slot.
    ///
    /// Fails fast with `RateLimitExceeded` when the provider's declared quota for the
    /// current window is spent.
    pub async fn acquire(&self, class: ResourceClass, provider: &str) -> Result<FetchPermit> {
        if self.config.respect_rate_limits {
            self.check_quota(provider)?;
        }

        let permit = Arc::clone(self.semaphore(class))
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::SourceUnavailable {
                url: provider.to_string(),
                reason: format!("{class} gate closed"),
            })?;

        if self.config.respect_rate_limits {
            let slot = self.reserve_slot(provider);
            if slot > Instant::now() {
                debug!(provider, %class, "Throttling request");
                tokio::time::sleep_until(slot).await;
            }
        }

        Ok(FetchPermit {
            class,
            _permit: permit,
        })
    }

    fn check_quota(&self, provider: &str) -> Result<()> {
        let Some(quota) = self.config.provider_quota else {
            return Ok(());
        };

        let now = Instant::now();
        let mut providers = self.providers.lock().expect("FetchGate poisoned");
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState {
                next_slot: now,
                window_start: now,
                window_count: 0,
            });

        if now.duration_since(state.window_start) >= quota.window {
            state.window_start = now;
            state.window_count = 0;
        }

        if state.window_count >= quota.max_requests {
            let retry_after = (state.window_start + quota.window).duration_since(now);
            return Err(PipelineError::RateLimitExceeded {
                provider: provider.to_string(),
                retry_after,
            });
        }

        state.window_count += 1;
        Ok(())
    }

    fn reserve_slot(&self, provider: &str) -> Instant {
        let now = Instant::now();
        let mut providers = self.providers.lock().expect("FetchGate poisoned");
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState {
                next_slot: now,
                window_start: now,
                window_count: 0,
            });

        let slot = state.next_slot.max(now);
        state.next_slot = slot + self.config.min_request_interval;
        slot
    }
}
