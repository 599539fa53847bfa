use std::time::Duration;

/// Knobs shared by every probing step.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Wait per transmission before a probe counts as unanswered.
    pub timeout: Duration,
    /// Extra transmissions after the first one goes unanswered.
    pub retries: u32,
    /// Probes in flight at once.
    pub concurrency: usize,
    /// Wait for application data after the handshake completes.
    pub banner_timeout: Duration,
    pub http_timeout: Duration,
    /// Overall limit for one batch; ports still outstanding count as unanswered.
    pub deadline: Option<Duration>,
    /// Reset full-connect handshakes once the banner has been read.
    pub teardown: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            timeout: Duration::from_secs(2),
            retries: 1,
            concurrency: 50,
            banner_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
            deadline: None,
            teardown: true,
        }
    }
}
