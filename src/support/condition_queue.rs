//! Deferred actions gated on state predicates
//!
//! An action whose execute condition already holds runs right away. Otherwise
//! it is kept until a state change satisfies either its remove condition
//! (dropped) or its execute condition (run once, then dropped). Remove is
//! checked first.

use parking_lot::Mutex;

pub type Condition<S> = Box<dyn Fn(&S, Option<&S>) -> bool + Send + Sync>;
pub type Action = Box<dyn FnOnce() + Send>;

struct Entry<S> {
    execute: Condition<S>,
    remove: Condition<S>,
    action: Action,
}

pub struct ConditionQueue<S> {
    entries: Mutex<Vec<Entry<S>>>,
}

impl<S> Default for ConditionQueue<S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<S> ConditionQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(&self, current: &S, execute: Condition<S>, remove: Condition<S>, action: Action) {
        if execute(current, None) {
            action();
            return;
        }
        self.entries.lock().push(Entry {
            execute,
            remove,
            action,
        });
    }

    /// Re-evaluate pending entries against a state transition
    pub fn process(&self, new: &S, old: &S) {
        let pending = std::mem::take(&mut *self.entries.lock());
        if pending.is_empty() {
            return;
        }

        let mut keep = Vec::new();
        let mut run = Vec::new();
        for entry in pending {
            if (entry.remove)(new, Some(old)) {
                continue;
            }
            if (entry.execute)(new, Some(old)) {
                run.push(entry.action);
            } else {
                keep.push(entry);
            }
        }

        {
            let mut entries = self.entries.lock();
            // entries queued while we were evaluating go after the survivors
            keep.append(&mut entries);
            *entries = keep;
        }

        for action in run {
            action();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_action(counter: &Arc<AtomicUsize>) -> Action {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_runs_immediately_when_condition_holds() {
        let queue = ConditionQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        queue.execute(
            &true,
            Box::new(|s: &bool, _: Option<&bool>| *s),
            Box::new(|_: &bool, _: Option<&bool>| false),
            counter_action(&runs),
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_deferred_until_state_satisfies() {
        let queue = ConditionQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        queue.execute(
            &0u8,
            Box::new(|s: &u8, _: Option<&u8>| *s == 2),
            Box::new(|s: &u8, _: Option<&u8>| *s == 9),
            counter_action(&runs),
        );
        queue.process(&1, &0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        queue.process(&2, &1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());

        // runs at most once
        queue.process(&2, &2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_checked_before_execute() {
        let queue = ConditionQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        queue.execute(
            &0u8,
            Box::new(|s: &u8, _: Option<&u8>| *s == 3),
            Box::new(|s: &u8, _: Option<&u8>| *s == 3),
            counter_action(&runs),
        );
        queue.process(&3, &0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
    }
}
