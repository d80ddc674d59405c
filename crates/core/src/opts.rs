use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Polling interval for backends without native push (`GATESYNC_REFRESH_SECS`, default 30s).
pub fn refresh_rate() -> Duration {
    let secs = std::env::var("GATESYNC_REFRESH_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs.max(1))
}

/// Capacity of internal channels (`GATESYNC_QUEUE_CAP`, default 2048).
pub fn queue_cap() -> usize {
    std::env::var("GATESYNC_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
        .max(1)
}

/// Label equality selector; an empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(pub BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a Kubernetes label selector (`k=v,k2=v2`).
    pub fn to_label_selector(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOpts {}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOpts {
    pub overwrite_existing: bool,
}

impl WriteOpts {
    pub fn create() -> Self { Self { overwrite_existing: false } }
    pub fn overwrite() -> Self { Self { overwrite_existing: true } }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOpts {
    pub ignore_not_exist: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOpts {
    pub selector: Selector,
}

#[derive(Debug, Clone)]
pub struct WatchOpts {
    /// Cancelling this stops the watch; both of its channels close afterwards.
    pub cancel: CancellationToken,
    pub refresh_rate: Duration,
    pub selector: Selector,
}

impl Default for WatchOpts {
    fn default() -> Self {
        Self { cancel: CancellationToken::new(), refresh_rate: refresh_rate(), selector: Selector::default() }
    }
}

impl WatchOpts {
    pub fn new(cancel: CancellationToken) -> Self { Self { cancel, ..Default::default() } }

    pub fn with_refresh_rate(mut self, rate: Duration) -> Self {
        self.refresh_rate = rate;
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn list_opts(&self) -> ListOpts { ListOpts { selector: self.selector.clone() } }
}
