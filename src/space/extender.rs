use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::common::{DbError, DbResult};
use crate::config::{EXTEND_FACTOR, SYS_FILE_ID};
use crate::core::Core;
use crate::space::extents::Extent;
use crate::storage::FilePage;

struct ExtState {
    queue: Mutex<Vec<u32>>,
    work: Condvar,
    generation: Mutex<u64>,
    done: Condvar,
    stop: AtomicBool,
}

/// Grows database files off the caller's thread. An allocation that finds
/// no free extent queues a request and waits for a growth generation; the
/// worker extends the file by at least `EXTEND_FACTOR` times the request
/// and registers the new pages as a free extent under its own transaction.
pub struct Extender {
    state: Arc<ExtState>,
}

impl Extender {
    pub fn new() -> Arc<Self> {
        Arc::new(Extender {
            state: Arc::new(ExtState {
                queue: Mutex::new(Vec::new()),
                work: Condvar::new(),
                generation: Mutex::new(0),
                done: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
        })
    }

    pub fn spawn(self: &Arc<Self>, core: Arc<Core>) -> JoinHandle<()> {
        let state = self.state.clone();
        std::thread::Builder::new()
            .name("extender".to_string())
            .spawn(move || worker(state, core))
            .expect("spawn extender")
    }

    pub fn shutdown(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.work.notify_all();
    }

    /// Queue a growth request and wait for the worker to complete one.
    pub fn request_and_wait(&self, _core: &Core, pages: u32) -> DbResult<()> {
        let start_gen = *self.state.generation.lock().unwrap();
        {
            let mut q = self.state.queue.lock().unwrap();
            q.push(pages);
        }
        self.state.work.notify_all();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut g = self.state.generation.lock().unwrap();
        while *g == start_gen {
            let now = Instant::now();
            if now >= deadline {
                return Err(DbError::OutOfSpace("file extension timed out".to_string()));
            }
            let (guard, _) = self
                .state
                .done
                .wait_timeout(g, deadline - now)
                .unwrap();
            g = guard;
        }
        Ok(())
    }
}

fn worker(state: Arc<ExtState>, core: Arc<Core>) {
    loop {
        let pages = {
            let mut q = state.queue.lock().unwrap();
            loop {
                if state.stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(p) = q.pop() {
                    // collapse queued requests into one growth
                    let extra: u32 = q.drain(..).sum();
                    break p + extra;
                }
                let (guard, _) = state.work.wait_timeout(q, Duration::from_millis(200)).unwrap();
                q = guard;
            }
        };
        if let Err(e) = grow(&core, pages) {
            error!(error = %e, pages, "file extension failed");
        }
        {
            let mut g = state.generation.lock().unwrap();
            *g += 1;
        }
        state.done.notify_all();
    }
}

fn grow(core: &Core, pages: u32) -> DbResult<()> {
    let file = core.files.get(SYS_FILE_ID)?;
    let old = file.page_count();
    let add = (pages * EXTEND_FACTOR).max(64);
    file.extend_to(old + add)?;
    info!(file = SYS_FILE_ID, old, add, "file extended");
    // the new tail becomes a free extent under a system transaction; a
    // crash between extend and this insert is healed by restart repair
    let tx = core.pool.begin(false, core.log.end_of_log())?;
    let res = core
        .space
        .insert_free_extent(core, &tx, Extent::new(FilePage::new(SYS_FILE_ID, old), add));
    match res {
        Ok(()) => core.txlog.commit(&tx),
        Err(e) => {
            core.txlog.abort(&tx, core.as_dispatch())?;
            Err(e)
        }
    }
}
