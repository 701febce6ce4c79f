// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use coverage::store::{HitFile, HitsStore, TestIdentity};
use coverage::{HitId, HitsInfo};

use crate::config::RecorderConfig;
use crate::counters::HitCounters;

/// Hit counts of one process, and the file they are flushed to.
pub struct HitContext {
    counters: HitCounters,
    store: HitsStore,
    path: PathBuf,
    test: Option<TestIdentity>,

    // Serializes writers of `path`.
    flush_lock: Mutex<()>,
}

impl HitContext {
    pub fn new(config: &RecorderConfig) -> Self {
        let store = HitsStore::new(&config.hits_dir);
        let path = store.new_file_path(&config.run_id);

        Self {
            counters: HitCounters::new(),
            store,
            path,
            test: config.test.clone(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn hit(&self, id: HitId) {
        self.counters.increment(id);
    }

    pub fn count(&self, id: HitId) -> u64 {
        self.counters.get(id)
    }

    pub fn snapshot(&self) -> HitsInfo {
        self.counters.snapshot()
    }

    /// Hit file owned by this context.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn test(&self) -> Option<&TestIdentity> {
        self.test.as_ref()
    }

    /// Replace the hit file with the current counts.
    ///
    /// Every flush writes the full snapshot, so the file always holds a
    /// complete, readable set of counts.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let file = HitFile::new(self.test.clone(), self.snapshot());
        self.store
            .write(&self.path, &file)
            .with_context(|| format!("unable to flush hits to {}", self.path.display()))?;

        debug!("flushed {} hit ids to {}", file.hits.len(), self.path.display());

        Ok(())
    }

    /// Flush, logging instead of returning a failure.
    pub fn try_flush(&self) {
        if let Err(err) = self.flush() {
            error!("{:#}", err);
        }
    }
}

/// Background thread that flushes a context at a fixed interval.
///
/// Stopping, or dropping, the handle flushes one last time.
pub struct PeriodicFlush {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicFlush {
    pub fn start(context: Arc<HitContext>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();

        let thread = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => context.try_flush(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            context.try_flush();
        });

        Self {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("periodic hit flush thread panicked");
            }
        }
    }
}

impl Drop for PeriodicFlush {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_flush_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let mut config = RecorderConfig::new(dir.path());
        config.test = Some(TestIdentity::new("Tests.Flush"));

        let context = HitContext::new(&config);
        context.hit(HitId(1));
        context.hit(HitId(1));
        context.hit(HitId(4));

        context.flush()?;
        context.flush()?;

        let store = HitsStore::new(dir.path());
        assert_eq!(store.hit_files()?, vec![context.path().to_owned()]);

        let contexts = store.read_contexts()?;
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].test, Some(TestIdentity::new("Tests.Flush")));
        assert_eq!(contexts[0].hits, context.snapshot());

        context.hit(HitId(4));
        context.flush()?;

        let hits = store.read()?;
        assert_eq!(hits.get(HitId(1)), 2);
        assert_eq!(hits.get(HitId(4)), 2);

        Ok(())
    }

    #[test]
    fn test_contexts_use_own_files() -> Result<()> {
        let dir = tempdir()?;
        let config = RecorderConfig::new(dir.path());

        let first = HitContext::new(&config);
        let second = HitContext::new(&config);
        assert_ne!(first.path(), second.path());

        first.hit(HitId(1));
        second.hit(HitId(1));
        second.hit(HitId(2));
        first.flush()?;
        second.flush()?;

        let hits = HitsStore::new(dir.path()).read()?;
        assert_eq!(hits.get(HitId(1)), 2);
        assert_eq!(hits.get(HitId(2)), 1);

        Ok(())
    }

    #[test]
    fn test_periodic_flush() -> Result<()> {
        let dir = tempdir()?;
        let context = Arc::new(HitContext::new(&RecorderConfig::new(dir.path())));
        context.hit(HitId(3));

        let flush = PeriodicFlush::start(context.clone(), Duration::from_millis(10));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !context.path().exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(context.path().exists());

        context.hit(HitId(3));
        flush.stop();

        let hits = HitsStore::new(dir.path()).read()?;
        assert_eq!(hits.get(HitId(3)), 2);

        Ok(())
    }
}
