// Copyright 2015 The tiny-http Contributors
// Copyright (c) 2026 The Hearth developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;

/// Manages a collection of worker threads that run the request handlers
/// and serialize their responses.
///
/// The workers stop by themselves once every clone of the pool has been
/// dropped.
#[derive(Clone)]
pub(crate) struct TaskPool {
    sender: Sender<Box<dyn FnOnce() + Send>>,
}

impl TaskPool {
    /// Initializes a new task pool with one worker per CPU.
    pub fn new() -> TaskPool {
        let (sender, receiver) = unbounded::<Box<dyn FnOnce() + Send>>();

        for n in 0..num_cpus::get() {
            let receiver: Receiver<Box<dyn FnOnce() + Send>> = receiver.clone();
            thread::Builder::new()
                .name(format!("hearth-worker-{}", n))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn a worker thread");
        }

        TaskPool { sender }
    }

    /// Executes a function on a worker thread.
    #[inline]
    pub fn spawn<F>(&self, code: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Can only fail if the workers are gone, in which case the server
        // is shutting down anyway.
        let _ = self.sender.send(Box::new(code));
    }
}

#[cfg(test)]
mod tests {
    use super::TaskPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn runs_spawned_tasks() {
        let pool = TaskPool::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) != 32 {
            assert!(std::time::Instant::now() < deadline, "tasks didn't run");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
