//! Fixed-size thread pools for capture tasks.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads pulling boxed jobs from one shared queue.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || worker_loop(receiver))
                .with_context(|| format!("spawn {} worker {}", name, id))?;
            workers.push(handle);
        }
        log::debug!("started {} pool with {} workers", name, size);
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("{} pool is closed", self.name))?;
        sender
            .send(Box::new(job))
            .map_err(|_| anyhow!("{} pool workers are gone", self.name))
    }

    /// Stop accepting jobs and join workers that finish within `grace`.
    ///
    /// Workers still busy after that are detached. Returns how many were.
    pub fn close(mut self, grace: Duration) -> usize {
        self.sender.take();
        let deadline = Instant::now() + grace;
        let mut detached = 0;
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::warn!("{} worker panicked", self.name);
                }
            } else {
                log::warn!(
                    "{} worker {:?} still busy at shutdown, detaching",
                    self.name,
                    handle.thread().name()
                );
                detached += 1;
            }
        }
        detached
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let Ok(rx) = receiver.lock() else {
                break;
            };
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
