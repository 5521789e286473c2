//! Scheduler loop: one periodic tick dispatching bounded worker units.
//!
//! Each unit runs, in order: startup recovery (once per process), stale
//! `processing` reset, then exactly one piece of work — an upload if anything
//! is queued, else a mirror-maintenance batch, else a reaper iteration. The
//! in-process flags here only stop duplicate passes inside this process;
//! cross-process correctness comes from the store's atomic claims.

use super::ArchiveService;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub struct Scheduler {
    service: ArchiveService,
    units: Arc<Semaphore>,
    startup_done: AtomicBool,
    mirror_running: AtomicBool,
    reaper_running: AtomicBool,
}

impl Scheduler {
    pub fn new(service: ArchiveService) -> Arc<Self> {
        let concurrency = service.config().worker_concurrency.max(1);
        Arc::new(Self {
            service,
            units: Arc::new(Semaphore::new(concurrency)),
            startup_done: AtomicBool::new(false),
            mirror_running: AtomicBool::new(false),
            reaper_running: AtomicBool::new(false),
        })
    }

    /// Spawn the periodic tick. The returned handle lives as long as the
    /// process; aborting it stops dispatch (running units finish on their own).
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let poll = Duration::from_millis(scheduler.service.config().worker_poll_ms.max(100));
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                scheduler.dispatch_tick().await;
            }
        })
    }

    /// Fill the free unit slots for this tick.
    async fn dispatch_tick(self: &Arc<Self>) {
        if let Some(m) = &self.service.metrics {
            if let Ok(queued) = self.service.store().count_queued().await {
                m.queued_archives.set(queued as i64);
            }
        }

        loop {
            let Ok(permit) = self.units.clone().try_acquire_owned() else {
                break;
            };
            let scheduler = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                scheduler.run_unit().await;
            });
            // One unit per tick is enough when the queue is empty; more units
            // only help when uploads are actually waiting.
            match self.service.store().count_queued().await {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }

    async fn run_unit(&self) {
        // 1. Startup recovery, at most once per process lifetime.
        if !self.startup_done.swap(true, Ordering::SeqCst) {
            match self.service.store().reset_all_processing().await {
                Ok(0) => {}
                Ok(n) => info!("startup recovery: reset {n} processing archive(s) to queued"),
                Err(e) => warn!("startup recovery failed: {e}"),
            }
        }

        // 2. Stale-processing reset.
        let stale_minutes = self.service.config().processing_stale_minutes;
        match self
            .service
            .store()
            .reset_stale_processing(stale_minutes)
            .await
        {
            Ok(0) => {}
            Ok(n) => warn!("reset {n} stale processing archive(s) to queued"),
            Err(e) => warn!("stale-processing reset failed: {e}"),
        }

        // 3. Uploads take precedence over maintenance.
        match self.service.store().count_queued().await {
            Ok(n) if n > 0 => {
                match self.service.process_next_upload().await {
                    Ok(true) => return,
                    Ok(false) => {} // disk gate or lost race; fall through
                    Err(e) => {
                        warn!("upload unit failed: {e}");
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("queue depth query failed: {e}");
                return;
            }
        }

        // 4. Mirror maintenance, single pass in flight per process.
        if !self.mirror_running.swap(true, Ordering::SeqCst) {
            let did = self.service.mirror_maintenance().await;
            self.mirror_running.store(false, Ordering::SeqCst);
            match did {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!("mirror maintenance failed: {e}");
                    return;
                }
            }
        }

        // 5. Deletion reaper, single pass in flight per process.
        if !self.reaper_running.swap(true, Ordering::SeqCst) {
            let result = self.service.reap_next().await;
            self.reaper_running.store(false, Ordering::SeqCst);
            match result {
                Ok(true) => debug!("reaper retired one archive"),
                Ok(false) => {}
                Err(e) => warn!("reaper iteration failed: {e}"),
            }
        }
    }
}
