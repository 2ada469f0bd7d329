use std::time::{Duration, Instant};

/// sessions tracked for flap detection
const MAX_TRACKED_SESSIONS: usize = 100;

/// flapping threshold: uniformly short sessions have a small spread
const FLAP_STDDEV_MS: f64 = 1000.0;

/// per-connection lifetime counters and session history
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// connection attempts, successful or not
    pub attempts: u32,
    /// successfully opened sockets
    pub successes: u32,
    /// when the current session was established
    pub connected_at: Option<Instant>,
    /// lengths of the most recent sessions, oldest first
    pub durations: Vec<Duration>,
    /// when the next reconnection attempt will fire, if one is scheduled
    pub next_reconnect_at: Option<Instant>,
}

impl ConnectionStats {
    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn record_success(&mut self) {
        self.successes += 1;
        self.connected_at = Some(Instant::now());
        self.next_reconnect_at = None;
    }

    /// close the current session, pushing its length into the history
    pub(crate) fn record_session_end(&mut self) -> Option<Duration> {
        let started = self.connected_at.take()?;
        let duration = started.elapsed();

        self.durations.push(duration);
        if self.durations.len() > MAX_TRACKED_SESSIONS {
            let excess = self.durations.len() - MAX_TRACKED_SESSIONS;
            self.durations.drain(..excess);
        }

        Some(duration)
    }

    /// classify connection stability from recent session lengths
    ///
    /// a relay that accepts and immediately drops produces uniformly short
    /// sessions; a small population standard deviation is the signature.
    /// evidence is only evaluated at multiples of three sessions.
    pub fn is_flapping(&self) -> bool {
        let n = self.durations.len();
        if n == 0 || n % 3 != 0 {
            return false;
        }

        let ms: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_millis() as f64)
            .collect();
        let mean = ms.iter().sum::<f64>() / n as f64;
        let variance = ms.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

        variance.sqrt() < FLAP_STDDEV_MS
    }
}
