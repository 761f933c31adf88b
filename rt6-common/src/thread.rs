// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background threads with a shutdown flag that is raised, and the thread
//! joined, when the owning handle is dropped.

use crate::lock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

/// A named background thread. Not `Clone`: wrap it in an `Arc` if it must be
/// shared, so the join in `Drop` runs exactly once.
#[derive(Debug)]
pub struct ManagedThread {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl ManagedThread {
    /// Spawn `f` on a new thread called `name`. The closure receives the
    /// shutdown flag and is expected to return soon after it reads `true`.
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = Builder::new()
            .name(name.to_string())
            .spawn(move || f(flag))?;
        Ok(Self {
            name: name.to_string(),
            handle: Mutex::new(Some(handle)),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        lock!(self.handle)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Raise the shutdown flag and wait for the thread to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = lock!(self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        self.stop();
    }
}
