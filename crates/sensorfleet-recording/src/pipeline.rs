// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue-fed sensor recorder.
//!
//! Producers [`push`](RecorderPipeline::push) raw payloads; a writer thread
//! drains the queue into `{folder}/{device}/{unix}_{device}.{ext}`, where
//! `folder` is the segment last published by a drive watcher. Every payload
//! is written verbatim followed by the trailer marker.
//!
//! Shutdown enqueues [`RecordItem::EndOfStream`]; everything queued before it
//! is written, then the file is flushed and closed.

use crate::watcher::current_folder_filter;
use crate::RecorderError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use sensorfleet::{
    hostname, join_worker, unix_now, BrokerClient, Channel, ShutdownCoordinator, ShutdownHandler,
};
use sensorfleet_metrics::PerSecondMetrics;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default component class of a recorder.
pub const RECORDER_CLASS: &str = "Recorder";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_INTERVAL: Duration = Duration::from_millis(20);
const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(5);

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Device name; used in file names and metric tags.
    pub name: String,

    /// File extension, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Queue bound (None = unbounded).
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Interval between throughput metrics (milliseconds).
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    /// Marker appended after every item.
    #[serde(default = "default_trailer")]
    pub trailer: String,
}

fn default_extension() -> String {
    "bin".to_string()
}

fn default_metrics_interval_ms() -> u64 {
    1000
}

fn default_trailer() -> String {
    "<<SFEND>>".to_string()
}

impl RecorderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: default_extension(),
            queue_capacity: None,
            metrics_interval_ms: default_metrics_interval_ms(),
            trailer: default_trailer(),
        }
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn metrics_interval_ms(mut self, ms: u64) -> Self {
        self.metrics_interval_ms = ms;
        self
    }

    pub fn trailer(mut self, trailer: impl Into<String>) -> Self {
        self.trailer = trailer.into();
        self
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    /// File name for a file opened at `unix_secs`.
    pub fn file_name(&self, unix_secs: u64) -> String {
        format!("{}_{}.{}", unix_secs, self.name, self.extension)
    }

    /// File name used when `file_name` is already taken within the same
    /// second: `{unix}_{name}_{n}.{ext}`.
    pub fn file_name_with_suffix(&self, unix_secs: u64, suffix: u32) -> String {
        if suffix == 0 {
            return self.file_name(unix_secs);
        }
        format!("{}_{}_{}.{}", unix_secs, self.name, suffix, self.extension)
    }
}

/// Queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordItem {
    Payload(Vec<u8>),
    /// No more items; the writer closes its file and exits.
    EndOfStream,
}

/// Writer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderState {
    /// No file open yet.
    Idle = 0,
    Writing = 1,
    Stopped = 2,
}

impl RecorderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecorderState::Idle,
            1 => RecorderState::Writing,
            _ => RecorderState::Stopped,
        }
    }
}

/// Recorder counters.
#[derive(Debug, Default)]
pub struct RecorderStats {
    pub items_written: AtomicU64,
    pub items_dropped: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_opened: AtomicU64,
}

struct Shared {
    config: RecorderConfig,
    destination: RwLock<Option<PathBuf>>,
    open_file: RwLock<Option<PathBuf>>,
    state: AtomicU8,
    /// Set once the end-of-stream marker is being enqueued.
    closing: AtomicBool,
    stats: RecorderStats,
    per_second: PerSecondMetrics,
    metrics_topic: String,
    client: Option<Arc<dyn BrokerClient>>,
    last_drop_warning: Mutex<Option<Instant>>,
}

impl Shared {
    fn set_state(&self, state: RecorderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn note_drop(&self) {
        let dropped = self.stats.items_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        let mut last = self.last_drop_warning.lock();
        if last.map_or(true, |t| t.elapsed() >= DROP_WARNING_INTERVAL) {
            *last = Some(Instant::now());
            tracing::warn!(device = %self.config.name, dropped, "Recorder queue full, dropping items");
        }
    }

    fn publish_metrics(&self) {
        let points = self.per_second.take_points();
        let Some(client) = &self.client else {
            return;
        };
        for point in points {
            if let Err(e) = point.publish(client.as_ref(), &self.metrics_topic) {
                tracing::debug!("Failed to publish recorder metrics: {}", e);
            }
        }
    }
}

/// The file currently being written.
struct OpenFile {
    folder: PathBuf,
    path: PathBuf,
    out: BufWriter<File>,
}

impl OpenFile {
    fn create(shared: &Shared, folder: &Path) -> Result<Self, RecorderError> {
        let dir = folder.join(&shared.config.name);
        std::fs::create_dir_all(&dir)?;
        let (path, file) = Self::create_unique(&shared.config, &dir, unix_now() as u64)?;

        shared.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        *shared.open_file.write() = Some(path.clone());
        shared.set_state(RecorderState::Writing);
        tracing::info!(device = %shared.config.name, file = %path.display(), "Opened recording file");

        Ok(Self {
            folder: folder.to_path_buf(),
            path,
            out: BufWriter::new(file),
        })
    }

    /// Never truncates an earlier recording; a taken name gets a suffix.
    fn create_unique(
        config: &RecorderConfig,
        dir: &Path,
        unix_secs: u64,
    ) -> io::Result<(PathBuf, File)> {
        let mut suffix = 0;
        loop {
            let path = dir.join(config.file_name_with_suffix(unix_secs, suffix));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, shared: &Shared, payload: &[u8]) -> Result<(), RecorderError> {
        self.out.write_all(payload)?;
        self.out.write_all(shared.config.trailer.as_bytes())?;

        let bytes = (payload.len() + shared.config.trailer.len()) as u64;
        shared.stats.items_written.fetch_add(1, Ordering::Relaxed);
        shared.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        shared.per_second.tick(&shared.config.name);
        Ok(())
    }

    fn close(mut self, shared: &Shared) -> Result<(), RecorderError> {
        *shared.open_file.write() = None;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        tracing::debug!(file = %self.path.display(), "Closed recording file");
        Ok(())
    }
}

struct WriterLoop {
    shared: Arc<Shared>,
    rx: Receiver<RecordItem>,
    file: Option<OpenFile>,
}

impl WriterLoop {
    fn run(mut self) {
        if let Err(e) = self.drain() {
            tracing::error!(device = %self.shared.config.name, "Recorder writer failed: {}", e);
        }

        if let Some(file) = self.file.take() {
            if let Err(e) = file.close(&self.shared) {
                tracing::error!(device = %self.shared.config.name, "Failed to close recording: {}", e);
            }
        }

        self.shared.publish_metrics();
        self.shared.set_state(RecorderState::Stopped);
        tracing::debug!(device = %self.shared.config.name, "Recorder writer stopped");
    }

    fn drain(&mut self) -> Result<(), RecorderError> {
        let metrics_interval = self.shared.config.metrics_interval();
        let mut last_metrics = Instant::now();

        loop {
            if last_metrics.elapsed() >= metrics_interval {
                self.shared.publish_metrics();
                last_metrics = Instant::now();
            }

            self.follow_destination()?;

            // Without a destination, items stay queued.
            if self.file.is_none() {
                if self.shared.closing.load(Ordering::Acquire) {
                    self.discard_queued();
                    return Ok(());
                }
                thread::sleep(IDLE_INTERVAL);
                continue;
            }

            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(RecordItem::Payload(payload)) => {
                    // The folder may have moved while waiting.
                    self.follow_destination()?;
                    if let Some(file) = self.file.as_mut() {
                        file.write(&self.shared, &payload)?;
                    }
                }
                Ok(RecordItem::EndOfStream) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(file) = self.file.as_mut() {
                        file.out.flush()?;
                    }
                }
            }
        }
    }

    fn discard_queued(&self) {
        let mut lost = 0u64;
        while let Ok(RecordItem::Payload(_)) = self.rx.recv_timeout(POLL_INTERVAL) {
            lost += 1;
        }
        if lost > 0 {
            tracing::warn!(
                device = %self.shared.config.name,
                items = lost,
                "Items never reached a destination"
            );
        }
    }

    /// Switch files when the published destination moved.
    fn follow_destination(&mut self) -> Result<(), RecorderError> {
        let Some(destination) = self.shared.destination.read().clone() else {
            return Ok(());
        };
        if self.file.as_ref().is_some_and(|f| f.folder == destination) {
            return Ok(());
        }

        if let Some(file) = self.file.take() {
            file.close(&self.shared)?;
        }
        self.file = Some(OpenFile::create(&self.shared, &destination)?);
        Ok(())
    }
}

/// Records one device's payloads into the current segment folder.
pub struct RecorderPipeline {
    shared: Arc<Shared>,
    coordinator: Arc<ShutdownCoordinator>,
    /// Taken at shutdown; `push` holds the read lock across its send.
    tx: RwLock<Option<Sender<RecordItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecorderPipeline {
    /// Start the writer thread and follow published segment folders.
    ///
    /// The pipeline registers itself as the coordinator's shutdown handler.
    pub fn start(
        coordinator: Arc<ShutdownCoordinator>,
        config: RecorderConfig,
    ) -> Result<Arc<Self>, RecorderError> {
        let (tx, rx) = match config.queue_capacity {
            Some(capacity) => channel::bounded(capacity.max(1)),
            None => channel::unbounded(),
        };

        let identity = coordinator.identity().clone();
        let client = coordinator.client();
        let shared = Arc::new(Shared {
            destination: RwLock::new(None),
            open_file: RwLock::new(None),
            state: AtomicU8::new(RecorderState::Idle as u8),
            closing: AtomicBool::new(false),
            stats: RecorderStats::default(),
            per_second: PerSecondMetrics::new(hostname()),
            metrics_topic: identity.topic(Channel::Metric, "per_second"),
            client: client.clone(),
            last_drop_warning: Mutex::new(None),
            config,
        });

        if let Some(client) = &client {
            let follower = Arc::clone(&shared);
            client.subscribe_fn(&current_folder_filter(), move |message| {
                match message.payload.as_text() {
                    Some(folder) if !folder.is_empty() => {
                        *follower.destination.write() = Some(PathBuf::from(folder));
                    }
                    _ => tracing::warn!(topic = %message.topic, "Ignoring malformed folder"),
                }
            })?;
        } else {
            tracing::warn!(
                device = %shared.config.name,
                "Recorder running without a broker; set the destination directly"
            );
        }

        let writer = WriterLoop {
            shared: Arc::clone(&shared),
            rx,
            file: None,
        };
        let handle = thread::Builder::new()
            .name(format!("recorder-{}", shared.config.name))
            .spawn(move || writer.run())?;

        let pipeline = Arc::new(Self {
            shared,
            coordinator: Arc::clone(&coordinator),
            tx: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        });
        coordinator.set_handler(&pipeline);

        tracing::info!(device = %pipeline.shared.config.name, "Recorder started");
        Ok(pipeline)
    }

    /// Queue one payload. Never blocks; a full bounded queue drops the item.
    ///
    /// An accepted item is always queued ahead of the end-of-stream marker.
    pub fn push(&self, payload: Vec<u8>) -> Result<(), RecorderError> {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            return Err(RecorderError::Closed);
        };
        match tx.try_send(RecordItem::Payload(payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.note_drop();
                Err(RecorderError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(RecorderError::Closed),
        }
    }

    /// Override the destination folder.
    pub fn set_destination(&self, folder: impl Into<PathBuf>) {
        *self.shared.destination.write() = Some(folder.into());
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.shared.destination.read().clone()
    }

    /// Path of the file currently open, if any.
    pub fn open_file(&self) -> Option<PathBuf> {
        self.shared.open_file.read().clone()
    }

    pub fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.shared.stats
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.shared.config
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }
}

impl ShutdownHandler for RecorderPipeline {
    fn shutdown(&self) -> anyhow::Result<()> {
        let tx = {
            let mut slot = self.tx.write();
            self.shared.closing.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(tx) = tx {
            // Blocking send: the sentinel must not be dropped.
            if tx.send(RecordItem::EndOfStream).is_err() {
                tracing::debug!(device = %self.shared.config.name, "Writer already gone");
            }
        }
        if let Some(handle) = self.worker.lock().take() {
            join_worker(handle, "recorder");
        }

        let stats = &self.shared.stats;
        tracing::info!(
            device = %self.shared.config.name,
            written = stats.items_written.load(Ordering::Relaxed),
            dropped = stats.items_dropped.load(Ordering::Relaxed),
            files = stats.files_opened.load(Ordering::Relaxed),
            "Recorder stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorfleet::{Broker, ClientOptions, MemoryBroker, NodeIdentity, Payload};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn recorder(broker: &MemoryBroker, config: RecorderConfig) -> Arc<RecorderPipeline> {
        let coordinator = ShutdownCoordinator::register(NodeIdentity::new(RECORDER_CLASS), broker);
        RecorderPipeline::start(coordinator, config).expect("recorder")
    }

    #[test]
    fn test_file_name() {
        let config = RecorderConfig::new("cam1").extension("h264");
        assert_eq!(config.file_name(1_700_000_000), "1700000000_cam1.h264");
    }

    #[test]
    fn test_taken_file_name_gets_a_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RecorderConfig::new("cam1");
        std::fs::write(dir.path().join("1700000000_cam1.bin"), b"earlier").expect("write");

        let (path, _file) = OpenFile::create_unique(&config, dir.path(), 1_700_000_000)
            .expect("create");
        assert_eq!(path, dir.path().join("1700000000_cam1_1.bin"));
        let (path, _file) = OpenFile::create_unique(&config, dir.path(), 1_700_000_000)
            .expect("create");
        assert_eq!(path, dir.path().join("1700000000_cam1_2.bin"));

        let earlier = std::fs::read(dir.path().join("1700000000_cam1.bin")).expect("read");
        assert_eq!(earlier, b"earlier");
    }

    #[test]
    fn test_items_wait_for_first_destination() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(&broker, RecorderConfig::new("cam1"));

        recorder.push(b"early".to_vec()).expect("push");
        thread::sleep(Duration::from_millis(150));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(recorder.stats().items_written.load(Ordering::Relaxed), 0);

        recorder.set_destination(dir.path());
        assert!(wait_for(|| recorder.stats().items_written.load(Ordering::Relaxed) == 1));
        assert_eq!(recorder.state(), RecorderState::Writing);

        recorder.coordinator().shutdown();
        let path = recorder.open_file();
        assert!(path.is_none());
        assert_eq!(recorder.state(), RecorderState::Stopped);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let broker = MemoryBroker::new();
        let recorder = recorder(&broker, RecorderConfig::new("cam1").queue_capacity(2));

        // No destination yet: items stay queued, so the bound is reached.
        recorder.push(vec![1]).expect("first");
        recorder.push(vec![2]).expect("second");
        assert!(matches!(recorder.push(vec![3]), Err(RecorderError::QueueFull)));
        assert!(matches!(recorder.push(vec![4]), Err(RecorderError::QueueFull)));
        assert_eq!(recorder.stats().items_dropped.load(Ordering::Relaxed), 2);

        recorder.coordinator().shutdown();
        assert!(matches!(recorder.push(vec![1]), Err(RecorderError::Closed)));
    }

    #[test]
    fn test_follows_published_folder() {
        let broker = MemoryBroker::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = recorder(&broker, RecorderConfig::new("lidar"));

        let publisher = broker
            .connect(ClientOptions::new("watcher"))
            .expect("connect");
        publisher
            .publish(
                "DriveWatcher/1234/data/current_folder",
                Payload::text(dir.path().to_string_lossy()),
                true,
            )
            .expect("publish");

        assert!(wait_for(|| recorder.destination().as_deref() == Some(dir.path())));
        recorder.push(b"frame".to_vec()).expect("push");
        assert!(wait_for(|| recorder.open_file().is_some()));
        let file = recorder.open_file().expect("file");
        assert!(file.starts_with(dir.path().join("lidar")));

        recorder.coordinator().shutdown();
        let contents = std::fs::read(&file).expect("read");
        assert_eq!(contents, b"frame<<SFEND>>");
    }
}
