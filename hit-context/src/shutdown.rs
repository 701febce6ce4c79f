// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hooks that save recorded hits when the process ends.

use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;

type Hook = Box<dyn FnMut() + Send + Sync>;

struct Shutdown {
    hooks: RwLock<Vec<Hook>>,
}

lazy_static! {
    static ref SHUTDOWN: Arc<Shutdown> = Shutdown::new();
}

/// Register a hook to run at shutdown (when `execute` is called, or on Ctrl+C).
pub fn register<F: FnMut() + Send + Sync + 'static>(hook: F) {
    SHUTDOWN.register(hook)
}

/// Runs the registered hooks. They stay registered, so a later call runs them again.
pub fn execute() {
    SHUTDOWN.execute()
}

/// Runs the registered hooks and terminates the process with exit `code`.
pub fn exit_process(code: i32) -> ! {
    SHUTDOWN.exit_process(code)
}

impl Shutdown {
    fn empty() -> Arc<Self> {
        Arc::new(Shutdown {
            hooks: RwLock::new(vec![]),
        })
    }

    fn new() -> Arc<Self> {
        let shutdown = Self::empty();

        // Ctrl+C does not terminate the process by itself once a handler is
        // set, so the handler has to exit.
        let handler = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            warn!("Ctrl+C pressed, saving recorded hits");
            handler.exit_process(1);
        }) {
            warn!("unable to save hits on Ctrl+C: {}", err);
        }

        shutdown
    }

    fn register<F: FnMut() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    fn exit_process(&self, code: i32) -> ! {
        self.execute();
        std::process::exit(code);
    }

    fn execute(&self) {
        // Hooks run unlocked, so they may register more hooks.
        let mut hooks = {
            let mut registered = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *registered)
        };

        for hook in hooks.iter_mut() {
            hook();
        }

        let mut registered = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        let added = std::mem::replace(&mut *registered, hooks);
        registered.extend(added);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_hooks_run_on_execute() {
        let shutdown = Shutdown::empty();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        shutdown.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        shutdown.execute();
        shutdown.execute();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hook_can_register_hooks() {
        let shutdown = Shutdown::empty();
        let outer = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(AtomicUsize::new(0));

        let registered = AtomicBool::new(false);
        let (target, outer_runs, inner_runs) = (shutdown.clone(), outer.clone(), inner.clone());

        shutdown.register(move || {
            outer_runs.fetch_add(1, Ordering::SeqCst);

            if !registered.swap(true, Ordering::SeqCst) {
                let inner_runs = inner_runs.clone();
                target.register(move || {
                    inner_runs.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        shutdown.execute();
        assert_eq!(outer.load(Ordering::SeqCst), 1);
        assert_eq!(inner.load(Ordering::SeqCst), 0);

        shutdown.execute();
        assert_eq!(outer.load(Ordering::SeqCst), 2);
        assert_eq!(inner.load(Ordering::SeqCst), 1);
    }
}
