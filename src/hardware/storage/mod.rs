//! The storage pump: a queue-fed sibling of the CAN pump for persisted
//! key-value blobs. Writes and read requests are queued from any thread;
//! `update` services them against the installed backend, either driven by
//! the application or by the pump's own worker thread.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::UPDATE_WAKEUP_TIMEOUT_MS;
use crate::hardware::traits::StorageBackend;

/// Callback fired with the data of a completed read request.
pub type ReadStorageCallback = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

struct StorageShared {
    backend: Mutex<Option<Box<dyn StorageBackend>>>,
    writes: Mutex<VecDeque<(u64, Vec<u8>)>>,
    reads: Mutex<VecDeque<u64>>,
    read_callbacks: Mutex<Vec<ReadStorageCallback>>,
    running: AtomicBool,
    wakeup_pending: AtomicBool,
    wakeup_lock: Mutex<()>,
    wakeup: Condvar,
}

impl StorageShared {
    fn notify(&self) {
        self.wakeup_pending.store(true, Ordering::SeqCst);
        let _guard = self.wakeup_lock.lock().unwrap();
        self.wakeup.notify_all();
    }

    /// Service one queued read and one queued write. Returns `true` when
    /// any work was done.
    fn service_queues(&self) -> bool {
        let mut worked = false;

        let read = self.reads.lock().unwrap().pop_front();
        if let Some(id) = read {
            worked = true;
            let data = match self.backend.lock().unwrap().as_mut() {
                Some(backend) => backend.read(id),
                None => {
                    log::error!("[Storage]: no backend set, cannot read entry {}", id);
                    None
                }
            };
            match data {
                Some(data) => {
                    let callbacks = self.read_callbacks.lock().unwrap().clone();
                    for callback in callbacks {
                        callback(id, &data);
                    }
                }
                None => log::error!("[Storage]: failed to read entry {}", id),
            }
        }

        let write = self.writes.lock().unwrap().pop_front();
        if let Some((id, data)) = write {
            worked = true;
            let written = match self.backend.lock().unwrap().as_mut() {
                Some(backend) => backend.write(id, &data),
                None => {
                    log::error!("[Storage]: no backend set, cannot write entry {}", id);
                    false
                }
            };
            if !written {
                log::error!("[Storage]: failed to write entry {}", id);
            }
        }

        worked
    }
}

/// Queue-fed access to one [`StorageBackend`].
pub struct StorageInterface {
    shared: Arc<StorageShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageInterface {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StorageShared {
                backend: Mutex::new(None),
                writes: Mutex::new(VecDeque::new()),
                reads: Mutex::new(VecDeque::new()),
                read_callbacks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                wakeup_pending: AtomicBool::new(false),
                wakeup_lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Install the backend servicing all queued requests.
    pub fn set_backend(&self, backend: Box<dyn StorageBackend>) {
        *self.shared.backend.lock().unwrap() = Some(backend);
    }

    /// Queue `data` to be persisted under `id`.
    pub fn request_write(&self, id: u64, data: Vec<u8>) -> bool {
        self.shared.writes.lock().unwrap().push_back((id, data));
        self.shared.notify();
        true
    }

    /// Queue a read of the blob stored under `id`. Results are delivered to
    /// every registered read callback.
    pub fn request_read(&self, id: u64) -> bool {
        self.shared.reads.lock().unwrap().push_back(id);
        self.shared.notify();
        true
    }

    /// Register a callback for completed reads. Returns `false` when the
    /// same closure is already registered.
    pub fn add_read_callback(&self, callback: ReadStorageCallback) -> bool {
        let mut callbacks = self.shared.read_callbacks.lock().unwrap();
        if callbacks
            .iter()
            .any(|registered| Arc::ptr_eq(registered, &callback))
        {
            return false;
        }
        callbacks.push(callback);
        true
    }

    /// Remove a previously registered read callback.
    pub fn remove_read_callback(&self, callback: &ReadStorageCallback) -> bool {
        let mut callbacks = self.shared.read_callbacks.lock().unwrap();
        let before = callbacks.len();
        callbacks.retain(|registered| !Arc::ptr_eq(registered, callback));
        callbacks.len() != before
    }

    /// Service one queued read and one queued write against the backend.
    /// Returns `true` when any work was done. Applications that do not
    /// start the worker thread call this from their own periodic loop.
    pub fn update(&self) -> bool {
        self.shared.service_queues()
    }

    /// Spawn the worker thread draining the queues on demand.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            log::error!("[Storage]: cannot start the interface more than once");
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name("agribus-storage".into())
            .spawn(move || {
                while shared.running.load(Ordering::SeqCst) {
                    if !shared.wakeup_pending.swap(false, Ordering::SeqCst) {
                        let guard = shared.wakeup_lock.lock().unwrap();
                        let _ = shared
                            .wakeup
                            .wait_timeout(guard, Duration::from_millis(UPDATE_WAKEUP_TIMEOUT_MS))
                            .unwrap();
                    }
                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    while shared.service_queues() {}
                }
            });
        match worker {
            Ok(handle) => {
                *self.worker.lock().unwrap() = Some(handle);
                true
            }
            Err(error) => {
                log::error!("[Storage]: failed to spawn the worker thread: {error}");
                self.shared.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop and join the worker thread. Queued requests stay queued.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            log::error!("[Storage]: cannot stop the interface before it is started");
            return false;
        }
        self.shared.notify();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        true
    }

    /// Whether the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Default for StorageInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StorageInterface {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
