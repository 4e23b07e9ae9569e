//! Playback-simulation throttling for HTTP downloads
//!
//! A [`PlaybackThrottle`] is a token bucket that caps one transfer at a
//! multiple of the stream's bitrate. Each job owns its own bucket, so a
//! throttled job only ever sleeps its own task.

use std::time::Duration;
use tokio::time::Instant;

/// Token bucket sized to one second of the allowed rate
#[derive(Debug)]
pub struct PlaybackThrottle {
    rate_bps: u64,
    tokens: f64,
    last_refill: Instant,
}

impl PlaybackThrottle {
    /// Throttle for a stream of `bitrate_bps` bits per second, allowed to run
    /// `multiplier` times faster than real time
    ///
    /// Returns `None` when the resulting rate is zero or not finite, in which
    /// case the transfer is unthrottled.
    pub fn for_bitrate(bitrate_bps: u64, multiplier: f64) -> Option<Self> {
        let bytes_per_sec = bitrate_bps as f64 / 8.0 * multiplier;
        if !bytes_per_sec.is_finite() || bytes_per_sec < 1.0 {
            return None;
        }
        Some(Self::new(bytes_per_sec as u64))
    }

    /// Throttle at a fixed byte rate
    pub fn new(rate_bps: u64) -> Self {
        let rate_bps = rate_bps.max(1);
        Self {
            rate_bps,
            tokens: rate_bps as f64,
            last_refill: Instant::now(),
        }
    }

    /// Allowed bytes per second
    pub fn rate(&self) -> u64 {
        self.rate_bps
    }

    /// Wait until `bytes` may be written
    ///
    /// Chunks larger than the bucket are admitted in slices, so a single large
    /// read never stalls for more than the time its bytes are owed.
    pub async fn acquire(&mut self, bytes: u64) {
        let mut remaining = bytes as f64;
        while remaining > 0.0 {
            self.refill();

            let take = remaining.min(self.tokens);
            if take > 0.0 {
                self.tokens -= take;
                remaining -= take;
                continue;
            }

            let owed = remaining.min(self.rate_bps as f64);
            let wait = Duration::from_secs_f64(owed / self.rate_bps as f64);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_bps as f64).min(self.rate_bps as f64);
    }
}
