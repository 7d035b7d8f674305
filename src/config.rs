use std::env;
use std::time::Duration;

/// Engine configuration, passed at session construction and threaded through.
///
/// Replaces any notion of process-wide mutable defaults: every tunable the
/// engine consults lives here.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Analytics poll interval while outside an advert window.
    pub low_freq: Duration,
    /// Analytics poll interval while inside an active advert window.
    pub high_freq: Duration,
    /// How long a live ad break survives without a sustaining metadata cue.
    pub break_tolerance: Duration,
    /// Buffer near the live edge within which skipping an advert is denied,
    /// in seconds.
    pub live_tolerance: f64,
    /// Rewrite tracking beacon URLs to https before firing.
    pub force_https: bool,
    /// Total attempts for each schedule/manifest fetch (minimum 1).
    pub fetch_attempts: u32,
    /// Sleep between consecutive fetch attempts.
    pub fetch_backoff: Duration,
    /// Per-attempt request timeout.
    pub fetch_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            low_freq: Duration::from_millis(4000),
            high_freq: Duration::from_millis(500),
            break_tolerance: Duration::from_millis(6000),
            live_tolerance: 30.0,
            force_https: false,
            fetch_attempts: 2,
            fetch_backoff: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let millis = |key: &str, fallback: Duration| -> Duration {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            low_freq: millis("MIDROLL_POLL_LOW_MS", defaults.low_freq),
            high_freq: millis("MIDROLL_POLL_HIGH_MS", defaults.high_freq),
            break_tolerance: millis("MIDROLL_BREAK_TOLERANCE_MS", defaults.break_tolerance),
            live_tolerance: env::var("MIDROLL_LIVE_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.live_tolerance),
            force_https: env::var("MIDROLL_FORCE_HTTPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.force_https),
            fetch_attempts: env::var("MIDROLL_FETCH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_attempts),
            fetch_backoff: millis("MIDROLL_FETCH_BACKOFF_MS", defaults.fetch_backoff),
            fetch_timeout: millis("MIDROLL_FETCH_TIMEOUT_MS", defaults.fetch_timeout),
        }
    }
}
