//! Bounded watermarked queue (C1).
//!
//! Parameterised over whatever fill measure the caller uses (item count,
//! byte size); the queue itself never inspects the measure beyond comparing
//! it against configured marks. On every enqueue/dequeue the effective
//! severity is recomputed and, if it changed, the configured callback fires.
//! The queue never blocks: pushing past the highest mark still succeeds,
//! raising `drop_level` to the top severity, which callers must honour
//! before enqueueing further work.

use collector_core::model::Severity;

/// A single `(threshold, severity)` mark. Rising marks fire on ascent past
/// `threshold`; falling marks fire on descent back below it. One `Mark` list
/// serves both directions — the direction is implicit in whether the fill
/// count is increasing or decreasing relative to the previous call.
#[derive(Debug, Clone)]
pub struct Mark {
    pub threshold: usize,
    pub severity: Severity,
}

/// Invoked whenever the effective severity changes. The `defer` flag is
/// `true` precisely when the new severity is strictly worse than the old
/// one, matching the original's distinct defer/undefer callback pair
/// collapsed into a single closure that inspects direction itself.
pub type DropLevelCallback = Box<dyn FnMut(usize, Severity, bool) + Send>;

pub struct WatermarkQueue {
    marks: Vec<Mark>,
    count: usize,
    current_severity: Severity,
    callback: Option<DropLevelCallback>,
}

impl WatermarkQueue {
    pub fn new(mut marks: Vec<Mark>) -> Self {
        marks.sort_by_key(|m| m.threshold);
        Self {
            marks,
            count: 0,
            current_severity: Severity::Debug,
            callback: None,
        }
    }

    pub fn set_callback(&mut self, cb: DropLevelCallback) {
        self.callback = Some(cb);
    }

    pub fn drop_level(&self) -> Severity {
        self.current_severity
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Recompute the effective severity for the current fill count: the
    /// worst mark whose threshold is at-or-below `count`. Severity's `Ord`
    /// ranks more-important levels lower (`Critical` < `Error` < `Warn`),
    /// so the worst crossed mark is the *minimum*, not the maximum.
    fn effective_severity(&self) -> Severity {
        self.marks
            .iter()
            .filter(|m| self.count >= m.threshold)
            .map(|m| m.severity)
            .min()
            .unwrap_or(Severity::Debug)
    }

    fn reevaluate(&mut self) {
        let new_severity = self.effective_severity();
        if new_severity != self.current_severity {
            let defer = new_severity < self.current_severity;
            self.current_severity = new_severity;
            if let Some(cb) = self.callback.as_mut() {
                cb(self.count, new_severity, defer);
            }
        }
    }

    /// Record one enqueued item and re-evaluate the drop level. Never fails
    /// — overflow above the top mark simply raises severity to its maximum.
    pub fn enqueue(&mut self) {
        self.count += 1;
        self.reevaluate();
    }

    pub fn dequeue(&mut self) {
        if self.count > 0 {
            self.count -= 1;
        }
        self.reevaluate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rising_mark_fires_on_ascent() {
        let marks = vec![
            Mark { threshold: 5, severity: Severity::Warn },
            Mark { threshold: 10, severity: Severity::Error },
        ];
        let mut q = WatermarkQueue::new(marks);
        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired2 = fired.clone();
        q.set_callback(Box::new(move |count, sev, defer| {
            fired2.lock().unwrap().push((count, sev, defer));
        }));
        for _ in 0..5 {
            q.enqueue();
        }
        assert_eq!(q.drop_level(), Severity::Warn);
        for _ in 0..5 {
            q.enqueue();
        }
        assert_eq!(q.drop_level(), Severity::Error);
        let log = fired.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].2);
        assert!(log[1].2);
    }

    #[test]
    fn falling_mark_restores_acceptance() {
        let marks = vec![Mark { threshold: 5, severity: Severity::Warn }];
        let mut q = WatermarkQueue::new(marks);
        for _ in 0..5 {
            q.enqueue();
        }
        assert_eq!(q.drop_level(), Severity::Warn);
        for _ in 0..5 {
            q.dequeue();
        }
        assert_eq!(q.drop_level(), Severity::Debug);
    }

    #[test]
    fn overflow_above_top_mark_never_blocks() {
        let marks = vec![Mark { threshold: 1, severity: Severity::Critical }];
        let mut q = WatermarkQueue::new(marks);
        for _ in 0..1000 {
            q.enqueue();
        }
        assert_eq!(q.drop_level(), Severity::Critical);
        assert_eq!(q.len(), 1000);
    }
}
