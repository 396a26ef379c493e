//! Store, outbox and integrity configuration.
//!
//! All fields have defaults via `Default`; override individual fields with
//! struct update syntax and pass the result to
//! [`CampaignStoreBuilder::config`](crate::CampaignStoreBuilder::config).

use std::time::Duration;

/// What to do with a campaign whose journal fails integrity verification
/// at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Refuse both reads and writes for the campaign.
    #[default]
    Refuse,
    /// Incident-response mode: serve reads, refuse writes.
    ReadOnlyQuarantine,
}

/// Configuration for the durable apply queue and its worker.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use campaign_es::OutboxConfig;
///
/// let config = OutboxConfig {
///     max_attempts: 3,
///     ..OutboxConfig::default()
/// };
/// assert_eq!(config.max_attempts, 3);
/// assert_eq!(config.base_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Failed attempts before an item moves to `dead`.
    ///
    /// Default: 8.
    pub max_attempts: u32,

    /// First retry delay. Attempt `n` waits `base_delay * 2^(n-1)`, capped
    /// at [`max_delay`](OutboxConfig::max_delay), plus jitter.
    ///
    /// Default: 1 second.
    pub base_delay: Duration,

    /// Default: 5 minutes.
    pub max_delay: Duration,

    /// Fraction of the delay added as random jitter, `0.0..=1.0`.
    ///
    /// Default: 0.2.
    pub jitter: f64,

    /// How long a claim is held before another worker may take the item.
    ///
    /// Default: 30 seconds.
    pub lease: Duration,

    /// Items claimed per worker tick.
    ///
    /// Default: 64.
    pub batch_size: usize,

    /// Items applied concurrently. Items of one campaign never overlap.
    ///
    /// Default: 4.
    pub concurrency: usize,

    /// Interval between worker ticks when no wake-up arrives.
    ///
    /// Default: 500 milliseconds.
    pub poll_interval: Duration,

    /// Upper bound for applying one item.
    ///
    /// Default: 10 seconds.
    pub apply_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
            lease: Duration::from_secs(30),
            batch_size: 64,
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            apply_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`CampaignStore`](crate::CampaignStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Write an aggregate snapshot every this many events. `0` disables
    /// aggregate snapshots.
    ///
    /// Default: 100.
    pub snapshot_interval: u64,

    /// Write a projection snapshot every this many events during replay.
    /// `0` disables projection snapshots.
    ///
    /// Default: 500.
    pub projection_snapshot_interval: u64,

    /// Apply new events to the projection inside `execute`, right after
    /// append. The outbox still guarantees delivery if this fails.
    ///
    /// Default: `true`.
    pub inline_apply: bool,

    pub integrity_policy: IntegrityPolicy,

    /// How long an idle campaign actor stays alive.
    ///
    /// Default: 5 minutes.
    pub idle_timeout: Duration,

    /// Events read per journal page during loads and replays.
    ///
    /// Default: 256.
    pub page_size: usize,

    /// fsync journal appends. Only disable for throwaway stores.
    ///
    /// Default: `true`.
    pub fsync: bool,

    pub outbox: OutboxConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            projection_snapshot_interval: 500,
            inline_apply: true,
            integrity_policy: IntegrityPolicy::default(),
            idle_timeout: Duration::from_secs(300),
            page_size: 256,
            fsync: true,
            outbox: OutboxConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.integrity_policy, IntegrityPolicy::Refuse);
        assert_eq!(config.outbox.max_attempts, 8);
        assert!(config.inline_apply);
        assert!(config.fsync);
    }
}
