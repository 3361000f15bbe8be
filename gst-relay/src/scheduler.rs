//! Process-wide owner of the engine's event loop.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use crate::{
    engine::{Engine, EventLoop},
    error::{RelayError, Result},
};

static SCHEDULER_LIVE: AtomicBool = AtomicBool::new(false);

/// Scheduler tests share the process slot with every other test.
#[cfg(test)]
pub(crate) static TEST_SLOT: Mutex<()> = Mutex::new(());

struct Running {
    event_loop: Arc<dyn EventLoop>,
    thread: JoinHandle<()>,
}

pub struct Scheduler {
    engine: Arc<dyn Engine>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    /// Fails if another scheduler is alive in this process.
    pub fn new(engine: Arc<dyn Engine>) -> Result<Self> {
        if SCHEDULER_LIVE.swap(true, Ordering::AcqRel) {
            return Err(RelayError::Scheduler {
                reason: "a scheduler is already running in this process".to_string(),
            });
        }
        if let Err(e) = engine.init() {
            SCHEDULER_LIVE.store(false, Ordering::Release);
            return Err(e);
        }
        log::info!("scheduler created for {} engine", engine.name());
        Ok(Self {
            engine,
            running: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Starts pumping the engine's event loop on its own thread. Engines
    /// without one need nothing pumped.
    pub fn run(&self) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| RelayError::Scheduler {
                reason: "scheduler lock poisoned".to_string(),
            })?;
        if running.is_some() {
            return Ok(());
        }
        let Some(event_loop) = self.engine.event_loop() else {
            return Ok(());
        };

        let pump = Arc::clone(&event_loop);
        let thread = std::thread::Builder::new()
            .name("relay-event-loop".to_string())
            .spawn(move || pump.run())
            .map_err(|e| RelayError::Scheduler {
                reason: format!("spawn event loop: {}", e),
            })?;
        *running = Some(Running { event_loop, thread });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        if let Some(Running { event_loop, thread }) = running {
            event_loop.quit();
            if thread.join().is_err() {
                log::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        SCHEDULER_LIVE.store(false, Ordering::Release);
    }
}
