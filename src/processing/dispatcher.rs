use crate::error::{NeuroLayerError, Result};

use crossbeam::channel::{bounded, unbounded, Sender};
use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Run { label: String, task: Task },
    Barrier(Sender<()>),
    Shutdown,
}

/// Single worker thread running queued tasks strictly in submission order.
///
/// A task that fails or panics is logged and the worker moves on.
pub struct Dispatcher {
    sender: Sender<Message>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = unbounded::<Message>();
        let worker = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || {
                for message in receiver.iter() {
                    match message {
                        Message::Run { label, task } => {
                            debug!("dispatch: {}", label);
                            match catch_unwind(AssertUnwindSafe(task)) {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => error!("Task '{}' failed: {}", label, e),
                                Err(_) => error!("Task '{}' panicked", label),
                            }
                        }
                        Message::Barrier(done) => {
                            let _ = done.send(());
                        }
                        Message::Shutdown => break,
                    }
                }
            })?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    pub fn submit<F>(&self, label: &str, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.sender
            .send(Message::Run {
                label: label.to_string(),
                task: Box::new(task),
            })
            .map_err(|_| NeuroLayerError::Control("dispatcher has shut down".to_string()))
    }

    /// Blocks until every task submitted before this call has finished.
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = bounded(1);
        self.sender
            .send(Message::Barrier(done))
            .map_err(|_| NeuroLayerError::Control("dispatcher has shut down".to_string()))?;
        wait.recv()
            .map_err(|_| NeuroLayerError::Control("dispatcher worker exited".to_string()))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Dispatcher worker panicked on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_tasks_run_in_order() {
        let dispatcher = Dispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            dispatcher
                .submit("push", move || {
                    seen.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        dispatcher.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_survives_failures_and_panics() {
        let dispatcher = Dispatcher::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .submit("fails", || Err(NeuroLayerError::FilterFailure("boom".to_string())))
            .unwrap();
        dispatcher
            .submit("panics", || panic!("task blew up"))
            .unwrap();
        let after = Arc::clone(&seen);
        dispatcher
            .submit("after", move || {
                after.lock().unwrap().push("ran");
                Ok(())
            })
            .unwrap();

        dispatcher.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["ran"]);
    }

    #[test]
    fn test_drop_drains_queue() {
        let seen = Arc::new(Mutex::new(0));
        {
            let dispatcher = Dispatcher::new().unwrap();
            for _ in 0..10 {
                let seen = Arc::clone(&seen);
                dispatcher
                    .submit("count", move || {
                        *seen.lock().unwrap() += 1;
                        Ok(())
                    })
                    .unwrap();
            }
        }
        assert_eq!(*seen.lock().unwrap(), 10);
    }
}
