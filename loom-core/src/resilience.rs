//! The call envelope contract: retry with backoff, a per-key circuit
//! breaker, a last-good cache, fallback, and a synthetic default.
//!
//! `guarded_call` is total. Whatever the wrapped operation or the fallback
//! does, the caller receives an `Envelope`; invocation failure is never
//! observable as an error, only as a degraded envelope.

use crate::value::Value;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Ok,
    SyntheticOk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeSource {
    Primary,
    Cache,
    Fallback,
    Synthetic,
}

/// The universal return shape of a guarded invocation. `status` is `ok` only
/// for a first-class primary success; everything else is `synthetic_ok` with
/// `degraded = true` and the serving layer in `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub degraded: bool,
    pub reason: String,
    pub error: Option<String>,
    pub retries: u32,
    pub latency_ms: u64,
    pub source: EnvelopeSource,
    pub value: Value,
}

impl Envelope {
    fn primary(value: Value, retries: u32, latency_ms: u64) -> Self {
        Envelope {
            status: EnvelopeStatus::Ok,
            degraded: false,
            reason: String::new(),
            error: None,
            retries,
            latency_ms,
            source: EnvelopeSource::Primary,
            value,
        }
    }

    fn degraded(
        source: EnvelopeSource,
        reason: &str,
        error: Option<String>,
        retries: u32,
        latency_ms: u64,
        value: Value,
    ) -> Self {
        Envelope {
            status: EnvelopeStatus::SyntheticOk,
            degraded: true,
            reason: reason.to_string(),
            error,
            retries,
            latency_ms,
            source,
            value,
        }
    }
}

/// Tuning for one guarded invocation.
#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub default: Value,
    pub retry_budget: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub breaker_threshold: usize,
    pub breaker_window: Duration,
    pub breaker_cooldown: Duration,
    pub cache_ttl: Duration,
    pub prefer_cache: bool,
}

impl Default for GuardOptions {
    fn default() -> Self {
        GuardOptions {
            default: Value::Null,
            retry_budget: 2,
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_millis(400),
            breaker_threshold: 5,
            breaker_window: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(600),
            prefer_cache: true,
        }
    }
}

pub type Operation<'a> = &'a mut dyn FnMut() -> Result<Value, String>;
pub type Fallback<'a> = Box<dyn FnOnce() -> Result<Value, String> + 'a>;

#[derive(Debug, Default)]
struct Breaker {
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
struct CacheEntry {
    saved_at: Instant,
    value: Value,
}

/// Shared breaker + cache state, keyed by invocation key. One context is
/// shared across a whole run, parent and child activations included.
#[derive(Debug, Default)]
pub struct ResilienceContext {
    breakers: Mutex<HashMap<String, Breaker>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ResilienceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open check with the implicit half-open transition: once the cooldown
    /// has elapsed the breaker closes and its window clears, admitting one
    /// trial call.
    fn breaker_is_open(&self, key: &str, cooldown: Duration) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let b = breakers.entry(key.to_string()).or_default();
        match b.opened_at {
            Some(at) if at.elapsed() < cooldown => true,
            Some(_) => {
                debug!(key, "circuit cooldown elapsed, admitting trial");
                b.opened_at = None;
                b.failures.clear();
                false
            }
            None => false,
        }
    }

    fn breaker_on_failure(&self, key: &str, threshold: usize, window: Duration) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let b = breakers.entry(key.to_string()).or_default();
        let now = Instant::now();
        b.failures.push(now);
        b.failures.retain(|t| now.duration_since(*t) <= window);
        if b.failures.len() >= threshold && b.opened_at.is_none() {
            warn!(key, failures = b.failures.len(), "circuit opened");
            b.opened_at = Some(now);
        }
    }

    fn breaker_on_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let b = breakers.entry(key.to_string()).or_default();
        b.opened_at = None;
        b.failures.clear();
    }

    fn cache_put(&self, key: &str, value: Value) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            key.to_string(),
            CacheEntry {
                saved_at: Instant::now(),
                value,
            },
        );
    }

    fn cache_get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(key)
            .filter(|e| e.saved_at.elapsed() <= ttl)
            .map(|e| e.value.clone())
    }

    /// Totalized invocation: primary with retries, then cache, then
    /// fallback, then the synthetic default. Never returns an error.
    pub fn guarded_call(
        &self,
        key: &str,
        options: &GuardOptions,
        primary: Operation<'_>,
        fallback: Option<Fallback<'_>>,
    ) -> Envelope {
        if self.breaker_is_open(key, options.breaker_cooldown) {
            return self.serve_degraded(key, options, fallback, "circuit open", None, 0, None);
        }

        let started = Instant::now();
        let max_attempts = 1 + options.retry_budget;
        let mut last_error: Option<String> = None;
        for attempt in 0..max_attempts {
            match primary() {
                Ok(value) => {
                    self.cache_put(key, value.clone());
                    self.breaker_on_success(key);
                    return Envelope::primary(value, attempt, elapsed_ms(started));
                }
                Err(err) => {
                    debug!(key, attempt, %err, "guarded call attempt failed");
                    last_error = Some(err);
                    self.breaker_on_failure(key, options.breaker_threshold, options.breaker_window);
                    if attempt + 1 < max_attempts {
                        std::thread::sleep(backoff_delay(
                            attempt,
                            options.backoff_initial,
                            options.backoff_max,
                        ));
                    }
                }
            }
        }

        let retries = max_attempts.saturating_sub(1);
        self.serve_degraded(
            key,
            options,
            fallback,
            "primary failed",
            last_error,
            retries,
            Some(started),
        )
    }

    /// The shared degradation chain: cache → fallback → synthetic default.
    fn serve_degraded(
        &self,
        key: &str,
        options: &GuardOptions,
        fallback: Option<Fallback<'_>>,
        why: &str,
        error: Option<String>,
        retries: u32,
        started: Option<Instant>,
    ) -> Envelope {
        let latency = started.map(elapsed_ms).unwrap_or(0);
        if options.prefer_cache {
            if let Some(cached) = self.cache_get(key, options.cache_ttl) {
                return Envelope::degraded(
                    EnvelopeSource::Cache,
                    &format!("{}; served from cache", why),
                    error,
                    retries,
                    latency,
                    cached,
                );
            }
        }
        if let Some(fb) = fallback {
            if let Ok(value) = fb() {
                self.cache_put(key, value.clone());
                return Envelope::degraded(
                    EnvelopeSource::Fallback,
                    &format!("{}; served from fallback", why),
                    error,
                    retries,
                    started.map(elapsed_ms).unwrap_or(0),
                    value,
                );
            }
            // fallback errors are swallowed; drop to synthetic
        }
        Envelope::degraded(
            EnvelopeSource::Synthetic,
            &format!("{}; synthetic default", why),
            error,
            retries,
            started.map(elapsed_ms).unwrap_or(0),
            options.default.clone(),
        )
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Exponential backoff capped at `max`, plus up to 25% jitter.
fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let base = initial
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(max)
        .min(max);
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    base + base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> GuardOptions {
        GuardOptions {
            default: Value::Str("default".into()),
            retry_budget: 1,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            breaker_threshold: 2,
            breaker_window: Duration::from_secs(5),
            breaker_cooldown: Duration::from_millis(50),
            cache_ttl: Duration::from_secs(5),
            prefer_cache: true,
        }
    }

    #[test]
    fn primary_success_is_ok_and_cached() {
        let ctx = ResilienceContext::new();
        let env = ctx.guarded_call(
            "k",
            &fast_options(),
            &mut || Ok(Value::Int(7)),
            None,
        );
        assert_eq!(env.status, EnvelopeStatus::Ok);
        assert_eq!(env.source, EnvelopeSource::Primary);
        assert!(!env.degraded);
        assert_eq!(env.retries, 0);
        assert!(matches!(
            ctx.cache_get("k", Duration::from_secs(1)),
            Some(Value::Int(7))
        ));
    }

    #[test]
    fn retries_then_succeeds() {
        let ctx = ResilienceContext::new();
        let mut calls = 0;
        let env = ctx.guarded_call(
            "k",
            &fast_options(),
            &mut || {
                calls += 1;
                if calls < 2 {
                    Err("boom".to_string())
                } else {
                    Ok(Value::Bool(true))
                }
            },
            None,
        );
        assert_eq!(env.status, EnvelopeStatus::Ok);
        assert_eq!(env.retries, 1);
        assert_eq!(calls, 2);
    }

    #[test]
    fn exhaustion_serves_cache_before_synthetic() {
        let ctx = ResilienceContext::new();
        ctx.cache_put("k", Value::Str("last-good".into()));
        let env = ctx.guarded_call("k", &fast_options(), &mut || Err("down".to_string()), None);
        assert_eq!(env.status, EnvelopeStatus::SyntheticOk);
        assert_eq!(env.source, EnvelopeSource::Cache);
        assert!(env.degraded);
        assert_eq!(env.error.as_deref(), Some("down"));
        assert!(matches!(env.value, Value::Str(ref s) if s == "last-good"));
    }

    #[test]
    fn fallback_result_is_cached() {
        let ctx = ResilienceContext::new();
        let mut opts = fast_options();
        opts.prefer_cache = false;
        let env = ctx.guarded_call(
            "k",
            &opts,
            &mut || Err("down".to_string()),
            Some(Box::new(|| Ok(Value::Int(42)))),
        );
        assert_eq!(env.source, EnvelopeSource::Fallback);
        assert!(matches!(
            ctx.cache_get("k", Duration::from_secs(1)),
            Some(Value::Int(42))
        ));
    }

    #[test]
    fn failing_fallback_drops_to_synthetic() {
        let ctx = ResilienceContext::new();
        let env = ctx.guarded_call(
            "nocache",
            &fast_options(),
            &mut || Err("down".to_string()),
            Some(Box::new(|| Err("also down".to_string()))),
        );
        assert_eq!(env.source, EnvelopeSource::Synthetic);
        assert!(matches!(env.value, Value::Str(ref s) if s == "default"));
    }

    #[test]
    fn breaker_opens_and_skips_primary() {
        let ctx = ResilienceContext::new();
        let opts = fast_options();
        // threshold 2, budget 1: one exhausted call records two failures
        ctx.guarded_call("b", &opts, &mut || Err("down".to_string()), None);

        let mut invoked = false;
        let env = ctx.guarded_call(
            "b",
            &opts,
            &mut || {
                invoked = true;
                Ok(Value::Int(1))
            },
            None,
        );
        assert!(!invoked, "open circuit must not invoke the primary");
        assert_eq!(env.source, EnvelopeSource::Synthetic);
        assert!(env.reason.starts_with("circuit open"));
    }

    #[test]
    fn cooldown_admits_a_trial_that_closes_the_breaker() {
        let ctx = ResilienceContext::new();
        let opts = fast_options();
        ctx.guarded_call("b", &opts, &mut || Err("down".to_string()), None);
        std::thread::sleep(opts.breaker_cooldown + Duration::from_millis(10));

        let env = ctx.guarded_call("b", &opts, &mut || Ok(Value::Int(9)), None);
        assert_eq!(env.status, EnvelopeStatus::Ok);
        assert_eq!(env.source, EnvelopeSource::Primary);

        // the trial value became the last-good entry
        let env = ctx.guarded_call("b", &opts, &mut || Err("hiccup".to_string()), None);
        assert_eq!(env.source, EnvelopeSource::Cache);
        assert!(matches!(env.value, Value::Int(9)));
    }

    #[test]
    fn never_raises_even_on_panicky_looking_errors() {
        let ctx = ResilienceContext::new();
        let env = ctx.guarded_call(
            "nocache2",
            &fast_options(),
            &mut || Err("catastrophic".to_string()),
            None,
        );
        assert_eq!(env.status, EnvelopeStatus::SyntheticOk);
        assert_eq!(env.source, EnvelopeSource::Synthetic);
    }
}
