//! Presenter worker thread
//!
//! Blocks until the scheduler fires its trigger, runs exactly one composite
//! pass, then blocks again. Shutdown lets the running pass finish before the
//! thread is joined.

use crate::fps::PassCounter;
use crate::scheduler::Trigger;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Runs one composite pass; returns how many surfaces were skipped
pub trait Compose: Send + Sync {
    fn compose(&self) -> usize;
}

pub struct Presenter {
    trigger: Arc<Trigger>,
    thread: Option<JoinHandle<()>>,
}

impl Presenter {
    pub fn spawn(trigger: Arc<Trigger>, composer: Arc<dyn Compose>) -> io::Result<Self> {
        let waiter = Arc::clone(&trigger);
        let thread = thread::Builder::new()
            .name("presenter".to_string())
            .spawn(move || {
                info!("Presenter thread started");
                let mut counter = PassCounter::default();

                while waiter.wait() {
                    let skipped = composer.compose();
                    if let Some(report) = counter.tick(skipped) {
                        debug!(
                            "Composite passes: {:.1}/s, {} surfaces skipped",
                            report.passes_per_second, report.skipped
                        );
                    }
                }

                info!("Presenter thread stopped");
            })?;

        Ok(Self {
            trigger,
            thread: Some(thread),
        })
    }

    /// Stop after the current pass and join the thread
    pub fn shutdown(&mut self) {
        self.trigger.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Presenter thread panicked");
            }
        }
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
