use std::sync::{Arc, Condvar, Mutex};

use haven_types::error::{HavenError, Result};

/// Process lifecycle group: admission for background work plus cooperative
/// shutdown.
///
/// Every bubble task registers before running and holds its [`GroupGuard`]
/// until it exits, so [`stop`](ThreadGroup::stop) can block until the
/// engine is quiescent. Long-running work polls
/// [`is_stopped`](ThreadGroup::is_stopped) between steps.
pub struct ThreadGroup {
    state: Mutex<GroupState>,
    idle: Condvar,
}

struct GroupState {
    active: usize,
    stopped: bool,
}

impl ThreadGroup {
    pub fn new() -> Self {
        ThreadGroup {
            state: Mutex::new(GroupState {
                active: 0,
                stopped: false,
            }),
            idle: Condvar::new(),
        }
    }

    /// Register a unit of work. Fails once the group has been stopped.
    pub fn add(self: &Arc<Self>) -> Result<GroupGuard> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(HavenError::ShuttingDown);
        }
        state.active += 1;
        Ok(GroupGuard {
            group: Arc::clone(self),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Refuse new admissions, then block until all admitted work has exited.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        while state.active > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }

    /// Block until no admitted work remains. Unlike `stop`, new work may
    /// still be admitted afterwards.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.active > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by admitted work; releases the group slot on drop.
pub struct GroupGuard {
    group: Arc<ThreadGroup>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let mut state = self.group.state.lock().unwrap();
        state.active -= 1;
        if state.active == 0 {
            self.group.idle.notify_all();
        }
    }
}
