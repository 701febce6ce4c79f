// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The context that probes record into.
//!
//! A thread-scoped context set with [`with_context`] takes precedence over the
//! process context set with [`install`]. If neither exists when the first probe
//! fires, a process context is created from the environment.

use std::cell::RefCell;
use std::sync::{Arc, Once, PoisonError, RwLock};

use anyhow::Result;
use coverage::HitId;
use lazy_static::lazy_static;

use crate::config::RecorderConfig;
use crate::context::{HitContext, PeriodicFlush};
use crate::shutdown;

thread_local! {
    static SCOPED: RefCell<Option<Arc<HitContext>>> = RefCell::new(None);
}

struct ProcessContext {
    context: Arc<HitContext>,
    _flush: Option<PeriodicFlush>,
}

lazy_static! {
    static ref PROCESS: RwLock<Option<ProcessContext>> = RwLock::new(None);
    static ref FROM_ENV: Option<Arc<HitContext>> = context_from_env();
}

static SHUTDOWN_HOOK: Once = Once::new();

/// Install the process context, replacing any previous one.
///
/// The context is flushed at shutdown, and periodically if `config` sets a
/// flush interval.
pub fn install(config: &RecorderConfig) -> Arc<HitContext> {
    let context = Arc::new(HitContext::new(config));
    install_context(context.clone(), config);
    context
}

fn install_context(context: Arc<HitContext>, config: &RecorderConfig) {
    info!("recording hits to {}", context.path().display());

    let flush = config
        .flush_interval
        .map(|interval| PeriodicFlush::start(context.clone(), interval));

    // One hook serves every installed context.
    SHUTDOWN_HOOK.call_once(|| shutdown::register(flush_process_context));

    let previous = PROCESS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(ProcessContext {
            context,
            _flush: flush,
        });

    // Save what the replaced context recorded. Its flush thread stops on drop.
    if let Some(previous) = previous {
        previous.context.try_flush();
    }
}

fn flush_process_context() {
    let context = PROCESS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|process| process.context.clone());

    if let Some(context) = context {
        context.try_flush();
    }
}

fn context_from_env() -> Option<Arc<HitContext>> {
    match RecorderConfig::from_env() {
        Ok(config) => Some(install(&config)),
        Err(err) => {
            error!("unable to record hits: {:#}", err);
            None
        }
    }
}

/// Run `f` with `context` as the current thread's context.
pub fn with_context<R>(context: Arc<HitContext>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<HitContext>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            SCOPED.with(|scoped| *scoped.borrow_mut() = previous);
        }
    }

    let previous = SCOPED.with(|scoped| scoped.borrow_mut().replace(context));
    let _restore = Restore(previous);

    f()
}

/// The context a probe on this thread records into, if one exists yet.
pub fn current() -> Option<Arc<HitContext>> {
    if let Some(context) = SCOPED.with(|scoped| scoped.borrow().clone()) {
        return Some(context);
    }

    PROCESS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|process| process.context.clone())
}

/// Record one execution of `id`.
pub fn hit(id: HitId) {
    // Probes can run during thread teardown, after the scope is gone.
    let recorded = SCOPED
        .try_with(|scoped| match scoped.borrow().as_ref() {
            Some(context) => {
                context.hit(id);
                true
            }
            None => false,
        })
        .unwrap_or(false);

    if recorded {
        return;
    }

    {
        let process = PROCESS.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(process) = process.as_ref() {
            process.context.hit(id);
            return;
        }
    }

    if let Some(context) = FROM_ENV.as_ref() {
        context.hit(id);
    }
}

/// Flush the current context now.
pub fn flush() -> Result<()> {
    match current() {
        Some(context) => context.flush(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_scoped_context() -> Result<()> {
        let dir = tempdir()?;
        let config = RecorderConfig::new(dir.path());

        let outer = Arc::new(HitContext::new(&config));
        let inner = Arc::new(HitContext::new(&config));

        with_context(outer.clone(), || {
            hit(HitId(1));

            with_context(inner.clone(), || {
                hit(HitId(1));
                hit(HitId(2));
            });

            hit(HitId(3));
        });

        assert_eq!(outer.count(HitId(1)), 1);
        assert_eq!(outer.count(HitId(2)), 0);
        assert_eq!(outer.count(HitId(3)), 1);
        assert_eq!(inner.count(HitId(1)), 1);
        assert_eq!(inner.count(HitId(2)), 1);

        let current = with_context(inner.clone(), current);
        assert!(current.map_or(false, |context| Arc::ptr_eq(&context, &inner)));

        Ok(())
    }

    #[test]
    fn test_reinstall_flushes_contexts() -> Result<()> {
        let dir = tempdir()?;
        let config = RecorderConfig::new(dir.path());

        let first = install(&config);
        first.hit(HitId(1));

        let second = install(&config);
        second.hit(HitId(2));

        // Replacing a context saves it; shutdown saves the installed one.
        assert!(first.path().exists());
        shutdown::execute();
        assert!(second.path().exists());

        let hits = coverage::store::HitsStore::new(dir.path()).read()?;
        assert_eq!(hits.get(HitId(1)), 1);
        assert_eq!(hits.get(HitId(2)), 1);

        Ok(())
    }

    #[test]
    fn test_scope_restored_after_panic() -> Result<()> {
        let dir = tempdir()?;
        let context = Arc::new(HitContext::new(&RecorderConfig::new(dir.path())));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_context(context.clone(), || panic!("test panic"));
        }));
        assert!(result.is_err());

        let scoped = SCOPED.with(|scoped| scoped.borrow().is_some());
        assert!(!scoped);

        Ok(())
    }

    #[test]
    fn test_scoped_contexts_per_thread() -> Result<()> {
        let dir = tempdir()?;
        let context = Arc::new(HitContext::new(&RecorderConfig::new(dir.path())));

        let threads: Vec<_> = (0..10)
            .map(|_| {
                let context = context.clone();
                std::thread::spawn(move || {
                    with_context(context, || {
                        for _ in 0..100 {
                            hit(HitId(9));
                        }
                    })
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(context.count(HitId(9)), 1000);

        context.flush()?;
        let hits = coverage::store::HitsStore::new(dir.path()).read()?;
        assert_eq!(hits.get(HitId(9)), 1000);

        Ok(())
    }
}
