//! Health monitor: per-channel sliding window of success/failure outcomes
//! driving auto-disable and auto-enable.
//!
//! Keeps raw samples rather than a single smoothed EMA score so the
//! disable threshold can be expressed as a plain failure rate against
//! `ChannelDisableThreshold`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::{ChannelRepository, AbilityRepository, OptionsSnapshot};
use crate::error::Result;
use crate::types::ChannelStatus;

const WINDOW_SIZE: usize = 128;

#[derive(Default)]
struct Window {
    samples: VecDeque<bool>,
}

impl Window {
    fn push(&mut self, success: bool) {
        if self.samples.len() == WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(success);
    }

    fn failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !**s).count();
        failures as f64 / self.samples.len() as f64 * 100.0
    }
}

/// Classification of an upstream failure used to decide whether it alone
/// (independent of the rolling failure rate) warrants an immediate
/// auto-disable, e.g. an authentication or billing failure that will not
/// self-heal by retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
}

#[derive(Clone)]
pub struct HealthMonitor {
    windows: Arc<RwLock<HashMap<i64, Window>>>,
    channels: ChannelRepository,
    abilities: AbilityRepository,
}

impl HealthMonitor {
    pub fn new(channels: ChannelRepository, abilities: AbilityRepository) -> Self {
        HealthMonitor {
            windows: Arc::new(RwLock::new(HashMap::new())),
            channels,
            abilities,
        }
    }

    /// Records one outcome and, on failure, applies the auto-disable
    /// policy. Always a no-op with respect to persisted state on success
    /// except moving an `Unknown` channel to `Enabled` on its first
    /// successful probe.
    pub async fn emit(
        &self,
        channel_id: i64,
        success: bool,
        failure_kind: Option<FailureKind>,
        options: &OptionsSnapshot,
    ) -> Result<()> {
        let failure_rate = {
            let mut windows = self.windows.write().await;
            let window = windows.entry(channel_id).or_default();
            window.push(success);
            window.failure_rate()
        };

        if success {
            return Ok(());
        }

        let fatal = matches!(failure_kind, Some(FailureKind::Fatal));
        let over_threshold =
            options.automatic_disable_channel_enabled && failure_rate >= options.channel_disable_threshold;

        if fatal || over_threshold {
            self.disable(channel_id, fatal, failure_rate).await?;
        }
        Ok(())
    }

    async fn disable(&self, channel_id: i64, fatal: bool, failure_rate: f64) -> Result<()> {
        if let Some(channel) = self.channels.get_by_id(channel_id).await? {
            if channel.status == ChannelStatus::ManuallyDisabled {
                return Ok(());
            }
        }
        warn!(channel_id, fatal, failure_rate, "auto-disabling channel");
        self.channels.update_status(channel_id, ChannelStatus::AutoDisabled).await?;
        self.abilities.set_enabled(channel_id, false).await?;
        Ok(())
    }

    /// Canary sweep: for each `AutoDisabled` channel, run `probe` (a
    /// minimal chat call against the channel's first listed model) and
    /// flip the channel back to `Enabled` on success. Invoked from a
    /// background worker on `CHANNEL_TEST_FREQUENCY`.
    pub async fn sweep_auto_disabled<F, Fut>(&self, options: &OptionsSnapshot, probe: F) -> Result<()>
    where
        F: Fn(i64) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        if !options.automatic_enable_channel_enabled {
            return Ok(());
        }
        let candidates = self.channels.list_auto_disabled().await?;
        for channel in candidates {
            if probe(channel.id).await {
                info!(channel_id = channel.id, "canary probe succeeded, re-enabling channel");
                self.channels.update_status(channel.id, ChannelStatus::Enabled).await?;
                self.abilities.set_enabled(channel.id, true).await?;
                self.windows.write().await.remove(&channel.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_computed_over_window() {
        let mut window = Window::default();
        window.push(true);
        window.push(false);
        window.push(false);
        window.push(false);
        assert_eq!(window.failure_rate(), 75.0);
    }

    #[test]
    fn window_evicts_oldest_sample_past_capacity() {
        let mut window = Window::default();
        for _ in 0..WINDOW_SIZE {
            window.push(true);
        }
        window.push(false);
        assert_eq!(window.samples.len(), WINDOW_SIZE);
        assert!(window.failure_rate() > 0.0);
    }
}
