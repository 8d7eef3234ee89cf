/// Post-work memory check: is the ceiling breached, and should we act on it?
use crate::memory::MemorySampler;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type user hooks may return.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Veto hook: `Ok(true)` suppresses shutdown for this unit of work.
pub type SkipPredicate = Arc<dyn Fn(&WorkDescriptor) -> Result<bool, HookError> + Send + Sync>;

/// Side effect run once per acted-on breach, before the sequence starts.
pub type ShutdownHook = Arc<dyn Fn(&WorkDescriptor) -> Result<(), HookError> + Send + Sync>;

/// Asks the host to give memory back before the re-sample (allocator purge, cache drop).
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Identifies a unit of work for logs and hooks. Never interpreted by the guard.
#[derive(Debug, Clone, Serialize)]
pub struct WorkDescriptor {
    pub id: String,
    pub class: String,
    pub args: serde_json::Value,
}

impl WorkDescriptor {
    pub fn new(id: impl Into<String>, class: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            args,
        }
    }
}

/// Outcome of one post-work check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreachDecision {
    NoBreach,
    /// Over the ceiling, but the skip predicate vetoed action.
    Skipped { rss_mb: f64 },
    Breached { rss_mb: f64 },
}

pub struct BreachEvaluator {
    max_rss_mb: u64,
    gc: bool,
    sampler: Arc<dyn MemorySampler>,
    reclaim: Option<ReclaimHook>,
    skip: Option<SkipPredicate>,
}

impl BreachEvaluator {
    pub fn new(max_rss_mb: u64, gc: bool, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            max_rss_mb,
            gc,
            sampler,
            reclaim: None,
            skip: None,
        }
    }

    pub fn set_reclaim(&mut self, hook: ReclaimHook) {
        self.reclaim = Some(hook);
    }

    pub fn set_skip(&mut self, predicate: SkipPredicate) {
        self.skip = Some(predicate);
    }

    pub fn max_rss_mb(&self) -> u64 {
        self.max_rss_mb
    }

    /// Sample (and maybe re-sample) memory, then consult the skip predicate.
    pub fn evaluate(&self, work: &WorkDescriptor) -> BreachDecision {
        if self.max_rss_mb == 0 {
            return BreachDecision::NoBreach;
        }

        let Some(mut rss_mb) = self.sample() else {
            return BreachDecision::NoBreach;
        };
        if !self.over(rss_mb) {
            return BreachDecision::NoBreach;
        }

        if self.gc {
            debug!(rss_mb, max_rss_mb = self.max_rss_mb, "over ceiling, reclaiming before re-check");
            self.run_reclaim();
            let Some(resampled) = self.sample() else {
                return BreachDecision::NoBreach;
            };
            if !self.over(resampled) {
                debug!(before = rss_mb, after = resampled, "reclaim brought memory back under ceiling");
                return BreachDecision::NoBreach;
            }
            rss_mb = resampled;
        }

        if self.skip_requested(work) {
            warn!(
                rss_mb,
                max_rss_mb = self.max_rss_mb,
                work_id = %work.id,
                class = %work.class,
                "memory ceiling exceeded, shutdown skipped by predicate"
            );
            return BreachDecision::Skipped { rss_mb };
        }

        BreachDecision::Breached { rss_mb }
    }

    fn over(&self, rss_mb: f64) -> bool {
        rss_mb > self.max_rss_mb as f64
    }

    /// `None` when both sampling paths fail; callers treat that as no breach.
    fn sample(&self) -> Option<f64> {
        match self.sampler.resident_mb() {
            Ok(mb) => return Some(mb),
            Err(e) => debug!(error = %e, "fast memory sample failed, trying slow path"),
        }
        match self.sampler.resident_mb_slow() {
            Ok(mb) => Some(mb),
            Err(e) => {
                warn!(error = %e, "memory sample failed, skipping breach check");
                None
            }
        }
    }

    fn run_reclaim(&self) {
        if let Some(reclaim) = &self.reclaim {
            if catch_unwind(AssertUnwindSafe(|| reclaim())).is_err() {
                warn!("reclaim hook panicked");
            }
        }
    }

    /// Errors and panics count as "do not skip".
    fn skip_requested(&self, work: &WorkDescriptor) -> bool {
        let Some(skip) = &self.skip else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| skip(work))) {
            Ok(Ok(skip)) => skip,
            Ok(Err(e)) => {
                warn!(error = %e, work_id = %work.id, "skip predicate failed, not skipping");
                false
            }
            Err(_) => {
                warn!(work_id = %work.id, "skip predicate panicked, not skipping");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SampleError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns scripted readings in order, repeating the last one.
    struct Scripted {
        readings: Mutex<Vec<Result<f64, ()>>>,
        slow: Result<f64, ()>,
        fast_calls: AtomicUsize,
        slow_calls: AtomicUsize,
    }

    impl Scripted {
        fn new(readings: Vec<Result<f64, ()>>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings),
                slow: Err(()),
                fast_calls: AtomicUsize::new(0),
                slow_calls: AtomicUsize::new(0),
            })
        }

        fn with_slow(readings: Vec<Result<f64, ()>>, slow: Result<f64, ()>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings),
                slow,
                fast_calls: AtomicUsize::new(0),
                slow_calls: AtomicUsize::new(0),
            })
        }
    }

    fn fail() -> SampleError {
        SampleError::CommandFailed { code: Some(1) }
    }

    impl MemorySampler for Scripted {
        fn resident_mb(&self) -> Result<f64, SampleError> {
            self.fast_calls.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            let next = if readings.len() > 1 {
                readings.remove(0)
            } else {
                readings[0]
            };
            next.map_err(|_| fail())
        }

        fn resident_mb_slow(&self) -> Result<f64, SampleError> {
            self.slow_calls.fetch_add(1, Ordering::SeqCst);
            self.slow.map_err(|_| fail())
        }
    }

    fn work() -> WorkDescriptor {
        WorkDescriptor::new("job-1", "ReportJob", serde_json::json!({"account": 7}))
    }

    #[test]
    fn test_disabled_ceiling_never_samples() {
        let sampler = Scripted::new(vec![Ok(1_000_000.0)]);
        let eval = BreachEvaluator::new(0, true, sampler.clone());
        assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach);
        assert_eq!(sampler.fast_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_at_or_below_ceiling_is_no_breach() {
        for rss in [0.0, 1.0, 1.999, 2.0] {
            let eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(rss)]));
            assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach, "rss {rss}");
        }
    }

    #[test]
    fn test_over_ceiling_breaches() {
        let eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(3.0)]));
        assert_eq!(
            eval.evaluate(&work()),
            BreachDecision::Breached { rss_mb: 3.0 }
        );
    }

    #[test]
    fn test_gc_resample_clears_transient_breach() {
        let sampler = Scripted::new(vec![Ok(3.0), Ok(1.5)]);
        let reclaims = Arc::new(AtomicUsize::new(0));
        let mut eval = BreachEvaluator::new(2, true, sampler.clone());
        let counter = Arc::clone(&reclaims);
        eval.set_reclaim(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach);
        assert_eq!(reclaims.load(Ordering::SeqCst), 1);
        assert_eq!(sampler.fast_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gc_resample_reports_fresh_value() {
        let eval = BreachEvaluator::new(2, true, Scripted::new(vec![Ok(3.0), Ok(2.5)]));
        assert_eq!(
            eval.evaluate(&work()),
            BreachDecision::Breached { rss_mb: 2.5 }
        );
    }

    #[test]
    fn test_gc_disabled_skips_reclaim_and_resample() {
        let sampler = Scripted::new(vec![Ok(3.0), Ok(1.0)]);
        let reclaims = Arc::new(AtomicUsize::new(0));
        let mut eval = BreachEvaluator::new(2, false, sampler.clone());
        let counter = Arc::clone(&reclaims);
        eval.set_reclaim(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(matches!(eval.evaluate(&work()), BreachDecision::Breached { .. }));
        assert_eq!(reclaims.load(Ordering::SeqCst), 0);
        assert_eq!(sampler.fast_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_reclaim_still_resamples() {
        let mut eval = BreachEvaluator::new(2, true, Scripted::new(vec![Ok(3.0), Ok(4.0)]));
        eval.set_reclaim(Arc::new(|| panic!("purge failed")));
        assert_eq!(
            eval.evaluate(&work()),
            BreachDecision::Breached { rss_mb: 4.0 }
        );
    }

    #[test]
    fn test_fast_path_failure_uses_slow_path() {
        let sampler = Scripted::with_slow(vec![Err(())], Ok(3.0));
        let eval = BreachEvaluator::new(2, false, sampler.clone());
        assert_eq!(
            eval.evaluate(&work()),
            BreachDecision::Breached { rss_mb: 3.0 }
        );
        assert_eq!(sampler.slow_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_both_paths_failing_is_no_breach() {
        let eval = BreachEvaluator::new(2, false, Scripted::new(vec![Err(())]));
        assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach);
    }

    #[test]
    fn test_resample_failure_is_no_breach() {
        let eval = BreachEvaluator::new(2, true, Scripted::new(vec![Ok(3.0), Err(())]));
        assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach);
    }

    #[test]
    fn test_skip_predicate_true_vetoes() {
        let mut eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(3.0)]));
        eval.set_skip(Arc::new(|w: &WorkDescriptor| -> Result<bool, HookError> {
            Ok(w.class == "ReportJob")
        }));
        assert_eq!(
            eval.evaluate(&work()),
            BreachDecision::Skipped { rss_mb: 3.0 }
        );
    }

    #[test]
    fn test_skip_predicate_false_breaches() {
        let mut eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(3.0)]));
        eval.set_skip(Arc::new(|_: &WorkDescriptor| -> Result<bool, HookError> { Ok(false) }));
        assert!(matches!(eval.evaluate(&work()), BreachDecision::Breached { .. }));
    }

    #[test]
    fn test_skip_predicate_error_does_not_veto() {
        let mut eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(3.0)]));
        eval.set_skip(Arc::new(|_: &WorkDescriptor| -> Result<bool, HookError> {
            Err("lookup failed".into())
        }));
        assert!(matches!(eval.evaluate(&work()), BreachDecision::Breached { .. }));
    }

    #[test]
    fn test_skip_predicate_panic_does_not_veto() {
        let mut eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(3.0)]));
        eval.set_skip(Arc::new(|_: &WorkDescriptor| -> Result<bool, HookError> {
            panic!("bad predicate")
        }));
        assert!(matches!(eval.evaluate(&work()), BreachDecision::Breached { .. }));
    }

    #[test]
    fn test_skip_predicate_not_consulted_below_ceiling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut eval = BreachEvaluator::new(2, false, Scripted::new(vec![Ok(1.0)]));
        eval.set_skip(Arc::new(move |_: &WorkDescriptor| -> Result<bool, HookError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }));
        assert_eq!(eval.evaluate(&work()), BreachDecision::NoBreach);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
