//! Mutex-guarded state with a post-mutation hook
//!
//! Mutations are serialized. The hook runs after the data lock is released,
//! receiving `(new, old)` snapshots, and may itself mutate again on the same
//! thread. Hooks from different threads never interleave.

use parking_lot::{Mutex, ReentrantMutex, RwLock};

pub type MutateHook<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

pub struct StateSync<T> {
    value: Mutex<T>,
    notify: ReentrantMutex<()>,
    on_mutate: RwLock<Option<MutateHook<T>>>,
}

impl<T: Clone> StateSync<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            notify: ReentrantMutex::new(()),
            on_mutate: RwLock::new(None),
        }
    }

    pub fn set_on_mutate(&self, hook: MutateHook<T>) {
        *self.on_mutate.write() = Some(hook);
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.lock())
    }

    pub fn snapshot(&self) -> T {
        self.value.lock().clone()
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _serial = self.notify.lock();
        let (old, new, result) = {
            let mut value = self.value.lock();
            let old = value.clone();
            let result = f(&mut value);
            (old, value.clone(), result)
        };
        if let Some(hook) = self.on_mutate.read().as_ref() {
            hook(&new, &old);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_hook_sees_new_and_old() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let state = StateSync::new(1u32);
        let sink = seen.clone();
        state.set_on_mutate(Box::new(move |new: &u32, old: &u32| sink.lock().push((*new, *old))));

        state.mutate(|v| *v = 2);
        state.mutate(|v| *v += 3);

        assert_eq!(*seen.lock(), vec![(2, 1), (5, 2)]);
        assert_eq!(state.snapshot(), 5);
    }

    #[test]
    fn test_hook_can_mutate_reentrantly() {
        let state = Arc::new(StateSync::new(0u32));
        let weak = Arc::downgrade(&state);
        state.set_on_mutate(Box::new(move |new: &u32, _old: &u32| {
            if *new == 1 {
                if let Some(state) = weak.upgrade() {
                    state.mutate(|v| *v = 10);
                }
            }
        }));

        state.mutate(|v| *v = 1);
        assert_eq!(state.read(|v| *v), 10);
    }
}
