//! Per-module resilience state: throttle buckets, concurrency semaphores,
//! and circuit breakers, all keyed by logical module name and shared across
//! runs. Retry delay schedules live here too.
//!
//! The policy stack itself (throttle → concurrency → circuit → cache →
//! retry → timeout → fallback → on_error) is driven by the executor; this
//! module owns the stateful pieces.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use flowlang_core::dag::{Backoff, Rate};

use crate::error::NodeError;

/// Tunables for the shared resilience state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures that open a circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before probing.
    pub reset_duration: Duration,
    /// Probes allowed while half-open.
    pub half_open_max_probes: u32,
    /// Hard cap on any retry delay.
    pub retry_delay_cap: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            failure_threshold: 5,
            reset_duration: Duration::from_secs(30),
            half_open_max_probes: 1,
            retry_delay_cap: Duration::from_secs(30),
        }
    }
}

/// Shared, cross-run resilience state.
pub struct Resilience {
    pub config: ResilienceConfig,
    throttles: DashMap<String, Arc<Mutex<TokenBucket>>>,
    semaphores: DashMap<String, Arc<Semaphore>>,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Resilience {
            config,
            throttles: DashMap::new(),
            semaphores: DashMap::new(),
            circuits: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------
    // Throttle: token bucket per module name
    // -----------------------------------------------------------------

    /// Suspends until a token is available for the module.
    pub async fn throttle(&self, module: &str, rate: Rate) {
        let bucket = self
            .throttles
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rate))))
            .clone();
        loop {
            let wait = {
                let mut bucket = bucket.lock();
                bucket.refill(rate);
                bucket.try_take()
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    // -----------------------------------------------------------------
    // Concurrency: semaphore per module name
    // -----------------------------------------------------------------

    /// The shared semaphore capping parallel executions of a module.
    pub fn concurrency(&self, module: &str, limit: u32) -> Arc<Semaphore> {
        self.semaphores
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
            .clone()
    }

    // -----------------------------------------------------------------
    // Circuit breaker: Closed -> Open -> HalfOpen per module name
    // -----------------------------------------------------------------

    /// Gate before a call. `Ok(probe)` admits (with `probe` set while
    /// half-open); an open circuit fails fast.
    pub fn circuit_admit(&self, module: &str) -> Result<bool, NodeError> {
        let circuit = self.circuit(module);
        let mut circuit = circuit.lock();
        match circuit.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                if circuit.opened_at.elapsed() >= self.config.reset_duration {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probes_in_flight = 1;
                    Ok(true)
                } else {
                    Err(NodeError::CircuitOpen {
                        module: module.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probes_in_flight < self.config.half_open_max_probes {
                    circuit.probes_in_flight += 1;
                    Ok(true)
                } else {
                    Err(NodeError::CircuitOpen {
                        module: module.to_string(),
                    })
                }
            }
        }
    }

    /// Records an attempt outcome.
    pub fn circuit_record(&self, module: &str, success: bool, probe: bool) {
        let circuit = self.circuit(module);
        let mut circuit = circuit.lock();
        if probe {
            circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
        }
        if success {
            // A successful probe closes the circuit; any success resets the
            // failure streak.
            circuit.consecutive_failures = 0;
            if matches!(circuit.state, CircuitState::HalfOpen) {
                circuit.state = CircuitState::Closed;
            }
            return;
        }
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Instant::now();
            }
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Instant::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn circuit(&self, module: &str) -> Arc<Mutex<Circuit>> {
        self.circuits
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
            .clone()
    }

    // -----------------------------------------------------------------
    // Retry delays
    // -----------------------------------------------------------------

    /// Delay before retry number `attempt` (1-based), per the schedule,
    /// capped.
    pub fn retry_delay(&self, backoff: Backoff, base: Duration, attempt: u32) -> Duration {
        let delay = match backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt),
            Backoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(31)),
        };
        delay.min(self.config.retry_delay_cap)
    }
}

struct TokenBucket {
    tokens: f64,
    rate_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: Rate) -> Self {
        TokenBucket {
            tokens: rate.count as f64,
            rate_per_second: rate.count as f64 / rate.per.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate: Rate) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        let per_second = rate.count as f64 / rate.per.as_secs_f64().max(f64::EPSILON);
        self.tokens = (self.tokens + elapsed * per_second).min(rate.count as f64);
        self.last_refill = Instant::now();
        self.rate_per_second = per_second;
    }

    /// Takes a token, or reports how long until one accrues.
    fn try_take(&mut self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return None;
        }
        let deficit = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(deficit / self.rate_per_second))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    probes_in_flight: u32,
    opened_at: Instant,
}

impl Circuit {
    fn new() -> Self {
        Circuit {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probes_in_flight: 0,
            opened_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resilience(threshold: u32, reset: Duration) -> Resilience {
        Resilience::new(ResilienceConfig {
            failure_threshold: threshold,
            reset_duration: reset,
            half_open_max_probes: 1,
            retry_delay_cap: Duration::from_secs(30),
        })
    }

    #[test]
    fn circuit_opens_after_consecutive_failures() {
        let r = resilience(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(r.circuit_admit("m").is_ok());
            r.circuit_record("m", false, false);
        }
        assert!(matches!(
            r.circuit_admit("m"),
            Err(NodeError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_failure_streak() {
        let r = resilience(3, Duration::from_secs(60));
        r.circuit_record("m", false, false);
        r.circuit_record("m", false, false);
        r.circuit_record("m", true, false);
        r.circuit_record("m", false, false);
        r.circuit_record("m", false, false);
        assert!(r.circuit_admit("m").is_ok(), "streak was broken");
    }

    #[tokio::test]
    async fn open_circuit_half_opens_after_reset() {
        let r = resilience(1, Duration::from_millis(50));
        r.circuit_record("m", false, false);
        assert!(r.circuit_admit("m").is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let admitted = r.circuit_admit("m").unwrap();
        assert!(admitted, "first call after reset is a probe");
        // The single probe slot is taken; a second call fails fast.
        assert!(r.circuit_admit("m").is_err());

        // Probe success closes the circuit.
        r.circuit_record("m", true, true);
        assert!(!r.circuit_admit("m").unwrap());
    }

    #[test]
    fn probe_failure_reopens() {
        let r = resilience(1, Duration::from_millis(0));
        r.circuit_record("m", false, false);
        let probe = r.circuit_admit("m").unwrap();
        assert!(probe);
        r.circuit_record("m", false, true);
        assert!(r.circuit_admit("m").is_err());
    }

    #[test]
    fn retry_delay_schedules() {
        let r = resilience(5, Duration::from_secs(60));
        let base = Duration::from_millis(100);
        assert_eq!(r.retry_delay(Backoff::Fixed, base, 3), base);
        assert_eq!(
            r.retry_delay(Backoff::Linear, base, 3),
            Duration::from_millis(300)
        );
        assert_eq!(
            r.retry_delay(Backoff::Exponential, base, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            r.retry_delay(Backoff::Exponential, base, 4),
            Duration::from_millis(800)
        );
        // Capped at 30 seconds.
        assert_eq!(
            r.retry_delay(Backoff::Exponential, Duration::from_secs(10), 10),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn throttle_suspends_until_token_available() {
        let r = Resilience::new(ResilienceConfig::default());
        let rate = Rate {
            count: 2,
            per: Duration::from_millis(100),
        };
        let start = Instant::now();
        r.throttle("m", rate).await;
        r.throttle("m", rate).await;
        assert!(start.elapsed() < Duration::from_millis(50), "burst admits");
        r.throttle("m", rate).await;
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "third token must wait for refill"
        );
    }
}
