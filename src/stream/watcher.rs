use super::ContinuousStream;
use crate::error::Result;

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Polls the backing file on a fixed interval and feeds new frames into the buffer.
pub struct FileWatcher {
    stream: Arc<ContinuousStream>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    pub fn new(stream: Arc<ContinuousStream>) -> Self {
        Self {
            stream,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// One polling step; returns the number of frames ingested.
    pub fn poll(&self) -> Result<usize> {
        self.stream.ingest()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&mut self, interval: Duration) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let stream = Arc::clone(&self.stream);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("file-watcher".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = stream.ingest() {
                        warn!("Stream read error: {}", e);
                    }
                    thread::sleep(interval);
                }
            })?;
        self.handle = Some(handle);
        info!("File watcher started ({} ms)", interval.as_millis());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("File watcher thread panicked");
            }
            info!("File watcher stopped");
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
