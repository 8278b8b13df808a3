//! Per-IP rate limiting.
//!
//! Two keyed token buckets gate `join_channel` and `message`. Both use the
//! governor crate's keyed rate limiters backed by DashMap.
//!
//! ## Adaptive budgets
//!
//! Errors in the message path are usually infrastructure trouble (store
//! timeouts, failovers) rather than client abuse, and clients retry on them.
//! Each observed error therefore raises both budgets by a step up to a
//! ceiling; once no error has been seen for the recovery period the budgets
//! return to their configured values. Changing a budget rebuilds the
//! limiter, which also resets per-address state.

use crate::config::LimitsConfig;
use crate::error::RateLimitError;
use governor::clock::{DefaultClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter =
    RateLimiter<IpAddr, dashmap::DashMap<IpAddr, InMemoryState>, DefaultClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Budgets {
    join: u32,
    message: u32,
}

#[derive(Debug)]
struct AdaptiveState {
    current: Budgets,
    last_error: Option<Instant>,
}

/// Rate limiters for the relay.
pub struct RateLimits {
    config: LimitsConfig,
    initial: Budgets,
    join_limiter: RwLock<Arc<KeyedLimiter>>,
    message_limiter: RwLock<Arc<KeyedLimiter>>,
    state: Mutex<AdaptiveState>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (join, message) = self.budgets();
        f.debug_struct("RateLimits")
            .field("enabled", &self.config.enabled)
            .field("join_budget", &join)
            .field("message_budget", &message)
            .finish()
    }
}

/// Build a limiter allowing `points` requests per `window`.
fn build_limiter(window: Duration, points: u32) -> KeyedLimiter {
    let burst = NonZeroU32::new(points).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(window / burst.get())
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst);
    RateLimiter::keyed(quota)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let initial = Budgets {
            join: config.join_limit,
            message: config.message_limit,
        };
        let window = Duration::from_secs(config.window_secs);
        Self {
            config: config.clone(),
            initial,
            join_limiter: RwLock::new(Arc::new(build_limiter(window, initial.join))),
            message_limiter: RwLock::new(Arc::new(build_limiter(window, initial.message))),
            state: Mutex::new(AdaptiveState {
                current: initial,
                last_error: None,
            }),
        }
    }

    /// Whether limits are enforced at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AdaptiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter(slot: &RwLock<Arc<KeyedLimiter>>) -> Arc<KeyedLimiter> {
        slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install(&self, budgets: Budgets) {
        let window = Duration::from_secs(self.config.window_secs);
        *self.join_limiter.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(build_limiter(window, budgets.join));
        *self.message_limiter.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(build_limiter(window, budgets.message));
    }

    /// Check if a join attempt from `ip` is allowed.
    pub fn check_join(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        if !self.enabled() {
            return Ok(());
        }
        self.reset_if_recovered();
        Self::limiter(&self.join_limiter)
            .check_key(&ip)
            .map_err(|_| RateLimitError::JoinLimitExceeded)
    }

    /// Check if a message from `ip` is allowed.
    pub fn check_message(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        if !self.enabled() {
            return Ok(());
        }
        self.reset_if_recovered();
        Self::limiter(&self.message_limiter)
            .check_key(&ip)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Raise both budgets by one step after an error in the message path.
    pub fn relax(&self) {
        let next = {
            let mut state = self.state();
            state.last_error = Some(Instant::now());
            let next = Budgets {
                join: (state.current.join + self.config.join_step).min(self.config.join_max),
                message: (state.current.message + self.config.message_step)
                    .min(self.config.message_max),
            };
            if next == state.current {
                return;
            }
            state.current = next;
            next
        };
        self.install(next);
        tracing::info!(
            join = next.join,
            message = next.message,
            "Rate limits relaxed after error"
        );
    }

    /// Restore the configured budgets once the recovery period has passed
    /// without errors. Returns whether a reset happened.
    pub fn reset_if_recovered(&self) -> bool {
        let recovery = Duration::from_secs(self.config.recovery_secs);
        {
            let mut state = self.state();
            let recovered = state
                .last_error
                .is_some_and(|at| at.elapsed() >= recovery);
            if !recovered || state.current == self.initial {
                return false;
            }
            state.current = self.initial;
            state.last_error = None;
        }
        self.install(self.initial);
        tracing::info!(
            join = self.initial.join,
            message = self.initial.message,
            "Rate limits restored"
        );
        true
    }

    /// Current (join, message) budgets per window.
    pub fn budgets(&self) -> (u32, u32) {
        let state = self.state();
        (state.current.join, state.current.message)
    }

    /// Number of tracked addresses (join, message).
    pub fn tracked_keys(&self) -> (usize, usize) {
        (
            Self::limiter(&self.join_limiter).len(),
            Self::limiter(&self.message_limiter).len(),
        )
    }

    /// Evict addresses whose buckets have fully recharged.
    pub fn shrink(&self) {
        let join = Self::limiter(&self.join_limiter);
        let message = Self::limiter(&self.message_limiter);
        join.retain_recent();
        message.retain_recent();
        join.shrink_to_fit();
        message.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config(join_limit: u32, message_limit: u32) -> LimitsConfig {
        LimitsConfig {
            enabled: true,
            window_secs: 60,
            join_limit,
            message_limit,
            ..LimitsConfig::default()
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn join_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(5, 100));
        for _ in 0..5 {
            assert!(limits.check_join(ip(1)).is_ok());
        }
        assert_eq!(
            limits.check_join(ip(1)),
            Err(RateLimitError::JoinLimitExceeded)
        );
    }

    #[test]
    fn message_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(100, 3));
        for _ in 0..3 {
            assert!(limits.check_message(ip(1)).is_ok());
        }
        assert_eq!(
            limits.check_message(ip(1)),
            Err(RateLimitError::MessageLimitExceeded)
        );
    }

    #[test]
    fn different_addresses_have_independent_limits() {
        let limits = RateLimits::new(&test_config(2, 2));
        assert!(limits.check_join(ip(1)).is_ok());
        assert!(limits.check_join(ip(1)).is_ok());
        assert!(limits.check_join(ip(1)).is_err());

        assert!(limits.check_join(ip(2)).is_ok());
        assert!(limits.check_join(ip(2)).is_ok());
        assert!(limits.check_join(ip(2)).is_err());
    }

    #[test]
    fn disabled_limits_allow_everything() {
        let config = LimitsConfig {
            enabled: false,
            join_limit: 1,
            ..LimitsConfig::default()
        };
        let limits = RateLimits::new(&config);
        for _ in 0..50 {
            assert!(limits.check_join(ip(1)).is_ok());
        }
        assert_eq!(limits.tracked_keys(), (0, 0));
    }

    #[test]
    fn relax_raises_budgets_up_to_ceiling() {
        let limits = RateLimits::new(&test_config(10, 100));
        limits.relax();
        assert_eq!(limits.budgets(), (15, 150));
        for _ in 0..20 {
            limits.relax();
        }
        assert_eq!(limits.budgets(), (40, 400));
    }

    #[test]
    fn relaxed_budget_admits_more_requests() {
        let limits = RateLimits::new(&test_config(1, 1));
        assert!(limits.check_join(ip(1)).is_ok());
        assert!(limits.check_join(ip(1)).is_err());

        limits.relax();
        // Rebuilt limiter with budget 6.
        for _ in 0..6 {
            assert!(limits.check_join(ip(1)).is_ok());
        }
        assert!(limits.check_join(ip(1)).is_err());
    }

    #[test]
    fn budgets_restore_after_recovery_period() {
        let config = LimitsConfig {
            recovery_secs: 0,
            ..test_config(10, 100)
        };
        let limits = RateLimits::new(&config);
        limits.relax();
        assert_eq!(limits.budgets(), (15, 150));
        assert!(limits.reset_if_recovered());
        assert_eq!(limits.budgets(), (10, 100));
        assert!(!limits.reset_if_recovered());
    }

    #[test]
    fn budgets_hold_during_recovery_period() {
        let limits = RateLimits::new(&test_config(10, 100));
        limits.relax();
        assert!(!limits.reset_if_recovered());
        assert_eq!(limits.budgets(), (15, 150));
    }

    #[test]
    fn shrink_keeps_limiter_usable() {
        let limits = RateLimits::new(&test_config(5, 5));
        let _ = limits.check_join(ip(1));
        let _ = limits.check_message(ip(2));
        assert_eq!(limits.tracked_keys(), (1, 1));
        limits.shrink();
        assert!(limits.check_join(ip(3)).is_ok());
    }

    #[test]
    fn rate_limits_are_debug() {
        let limits = RateLimits::new(&test_config(5, 5));
        let debug = format!("{:?}", limits);
        assert!(debug.contains("RateLimits"));
        assert!(debug.contains("join_budget"));
    }
}
