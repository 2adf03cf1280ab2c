// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Drive selection and segment rotation.
//!
//! The watcher keeps a priority list of drive roots. Every segment length it
//! picks the first root with enough free space, creates
//! `{root}/recordings/uncategorized/{timestamp}` plus the root's
//! `{root}/recordings/moments` folder, and publishes both paths retained on
//! `DriveWatcher/{uuid}/data/current_folder` and
//! `DriveWatcher/{uuid}/data/current_moment_folder`.
//!
//! Running out of space everywhere, or failing to create a segment folder,
//! is fleet-fatal: the watcher logs it and publishes the global shutdown
//! topic, once.

use crate::disk::{DiskUsage, GB};
use crate::DriveError;
use parking_lot::{Mutex, RwLock};
use sensorfleet::{
    join_worker, Channel, ConfigError, ConfigNode, ConfigSelector, Payload, ShutdownCoordinator,
    ShutdownHandler,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Component class of the watcher.
pub const DRIVE_WATCHER_CLASS: &str = "DriveWatcher";
/// Topic name of the active segment folder.
pub const CURRENT_FOLDER: &str = "current_folder";
/// Topic name of the active moments folder (`{segment}/../../moments`).
pub const CURRENT_MOMENT_FOLDER: &str = "current_moment_folder";

const RECORDINGS_DIR: &str = "recordings";
const UNCATEGORIZED_DIR: &str = "uncategorized";
const MOMENTS_DIR: &str = "moments";
const SEGMENT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// `DriveWatcher/+/data/current_folder`
pub fn current_folder_filter() -> String {
    format!("{}/+/{}/{}", DRIVE_WATCHER_CLASS, Channel::Data, CURRENT_FOLDER)
}

/// Moments folder of a segment: `{segment}/../../moments`, i.e.
/// `{root}/recordings/moments`, shared by every segment on that root.
pub fn moments_folder(segment: &Path) -> PathBuf {
    segment
        .parent()
        .and_then(Path::parent)
        .unwrap_or(segment)
        .join(MOMENTS_DIR)
}

/// Drive watcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveWatcherConfig {
    /// Candidate drive roots, in initial priority order.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Free-space floor (bytes).
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Segment length (seconds).
    #[serde(default = "default_segment_length_secs")]
    pub segment_length_secs: u64,

    /// Interval between capacity checks of the active root (seconds).
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_min_free_bytes() -> u64 {
    10 * GB
}

fn default_segment_length_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    5
}

impl Default for DriveWatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            min_free_bytes: default_min_free_bytes(),
            segment_length_secs: default_segment_length_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl DriveWatcherConfig {
    pub fn builder() -> DriveWatcherConfigBuilder {
        DriveWatcherConfigBuilder::default()
    }

    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_length_secs.max(1))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), DriveError> {
        if self.roots.is_empty() {
            return Err(DriveError::NoRoots);
        }
        Ok(())
    }
}

/// Builder for [`DriveWatcherConfig`].
#[derive(Debug, Default)]
pub struct DriveWatcherConfigBuilder {
    roots: Vec<PathBuf>,
    min_free_bytes: Option<u64>,
    segment_length_secs: Option<u64>,
    check_interval_secs: Option<u64>,
}

impl DriveWatcherConfigBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    pub fn min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = Some(bytes);
        self
    }

    pub fn segment_length_secs(mut self, secs: u64) -> Self {
        self.segment_length_secs = Some(secs);
        self
    }

    pub fn check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = Some(secs);
        self
    }

    pub fn build(self) -> DriveWatcherConfig {
        let defaults = DriveWatcherConfig::default();
        DriveWatcherConfig {
            roots: self.roots,
            min_free_bytes: self.min_free_bytes.unwrap_or(defaults.min_free_bytes),
            segment_length_secs: self
                .segment_length_secs
                .unwrap_or(defaults.segment_length_secs),
            check_interval_secs: self
                .check_interval_secs
                .unwrap_or(defaults.check_interval_secs),
        }
    }
}

/// One active recording segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub root: PathBuf,
    pub folder: PathBuf,
    pub moments: PathBuf,
}

/// Watches drive capacity and rotates segment folders.
pub struct DriveWatcher {
    config: DriveWatcherConfig,
    disk: Arc<dyn DiskUsage>,
    coordinator: Arc<ShutdownCoordinator>,
    folder_topic: String,
    moment_topic: String,
    /// Roots as last configured.
    configured: Mutex<Vec<PathBuf>>,
    /// Roots in current priority order.
    priority: Mutex<Vec<PathBuf>>,
    min_free_bytes: AtomicU64,
    segment_length_secs: AtomicU64,
    check_interval_secs: AtomicU64,
    current: RwLock<Option<Segment>>,
    escalated: AtomicBool,
    segments_created: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DriveWatcher {
    /// Create a watcher without starting its rotation thread.
    ///
    /// The watcher registers itself as the coordinator's shutdown handler.
    pub fn new(
        coordinator: Arc<ShutdownCoordinator>,
        config: DriveWatcherConfig,
        disk: Arc<dyn DiskUsage>,
    ) -> Result<Arc<Self>, DriveError> {
        config.validate()?;
        let identity = coordinator.identity().clone();

        let watcher = Arc::new(Self {
            folder_topic: identity.topic(Channel::Data, CURRENT_FOLDER),
            moment_topic: identity.topic(Channel::Data, CURRENT_MOMENT_FOLDER),
            configured: Mutex::new(config.roots.clone()),
            priority: Mutex::new(config.roots.clone()),
            min_free_bytes: AtomicU64::new(config.min_free_bytes),
            segment_length_secs: AtomicU64::new(config.segment_length_secs),
            check_interval_secs: AtomicU64::new(config.check_interval_secs),
            current: RwLock::new(None),
            escalated: AtomicBool::new(false),
            segments_created: AtomicU64::new(0),
            worker: Mutex::new(None),
            coordinator: Arc::clone(&coordinator),
            disk,
            config,
        });

        coordinator.set_handler(&watcher);
        Ok(watcher)
    }

    /// Create a watcher and start rotating segments.
    pub fn start(
        coordinator: Arc<ShutdownCoordinator>,
        config: DriveWatcherConfig,
        disk: Arc<dyn DiskUsage>,
    ) -> Result<Arc<Self>, DriveError> {
        let watcher = Self::new(coordinator, config, disk)?;

        let runner = Arc::clone(&watcher);
        let handle = thread::Builder::new()
            .name("drive-watcher".into())
            .spawn(move || runner.run())?;
        *watcher.worker.lock() = Some(handle);

        tracing::info!(
            roots = watcher.config.roots.len(),
            min_free_bytes = watcher.config.min_free_bytes,
            segment_length_secs = watcher.config.segment_length_secs,
            "Drive watcher started"
        );
        Ok(watcher)
    }

    /// Segment length currently in effect.
    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_length_secs.load(Ordering::Relaxed).max(1))
    }

    /// Capacity check interval currently in effect.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.load(Ordering::Relaxed).max(1))
    }

    fn run(&self) {
        let token = self.coordinator.cancellation_token();

        while !token.is_cancelled() {
            if self.rotate().is_err() {
                break;
            }

            // Durations are re-read every check so live updates apply to
            // the running segment.
            let started = Instant::now();
            loop {
                let deadline = started + self.segment_length();
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if token.wait_timeout(remaining.min(self.check_interval())) {
                    tracing::debug!("Drive watcher loop stopped");
                    return;
                }
                if self.active_root_below_floor() {
                    tracing::info!("Active drive fell below the free-space floor, rotating early");
                    break;
                }
            }
        }
        tracing::debug!("Drive watcher loop stopped");
    }

    /// Pick the first root with free space at or above the floor.
    ///
    /// A winner that is not already first moves to the front of the
    /// priority list.
    pub fn get_folder(&self) -> Result<PathBuf, DriveError> {
        let floor = self.min_free_bytes.load(Ordering::Relaxed);
        let mut priority = self.priority.lock();
        if priority.is_empty() {
            return Err(DriveError::NoRoots);
        }

        let mut chosen = None;
        for (index, root) in priority.iter().enumerate() {
            match self.disk.free_bytes(root) {
                Ok(free) if free >= floor => {
                    chosen = Some(index);
                    break;
                }
                Ok(free) => {
                    tracing::debug!(root = %root.display(), free, floor, "Drive below floor");
                }
                Err(e) => {
                    tracing::warn!(root = %root.display(), "Cannot query free space: {}", e);
                }
            }
        }

        let index = chosen.ok_or(DriveError::NoSpace {
            floor,
            roots: priority.len(),
        })?;
        if index != 0 {
            let root = priority.remove(index);
            tracing::info!(root = %root.display(), "Switching to drive");
            priority.insert(0, root);
        }
        Ok(priority[0].clone())
    }

    /// Start a new segment, escalating on failure.
    pub fn rotate(&self) -> Result<Segment, DriveError> {
        let result = self
            .get_folder()
            .and_then(|root| self.create_segment(&root));

        match result {
            Ok(segment) => {
                self.set_current_folder(segment.clone());
                Ok(segment)
            }
            Err(e) => {
                self.escalate(&e);
                Err(e)
            }
        }
    }

    fn create_segment(&self, root: &Path) -> Result<Segment, DriveError> {
        let parent = root.join(RECORDINGS_DIR).join(UNCATEGORIZED_DIR);
        let stamp = chrono::Local::now().format(SEGMENT_TIME_FORMAT).to_string();

        let mut folder = parent.join(&stamp);
        let mut suffix = 1;
        while folder.exists() {
            folder = parent.join(format!("{}_{}", stamp, suffix));
            suffix += 1;
        }
        let moments = moments_folder(&folder);

        for dir in [&folder, &moments] {
            std::fs::create_dir_all(dir).map_err(|source| DriveError::CreateFolder {
                path: dir.clone(),
                source,
            })?;
        }

        self.segments_created.fetch_add(1, Ordering::Relaxed);
        Ok(Segment {
            root: root.to_path_buf(),
            folder,
            moments,
        })
    }

    /// Make `segment` current and publish both paths retained.
    pub fn set_current_folder(&self, segment: Segment) {
        tracing::info!(folder = %segment.folder.display(), "New segment");

        if let Some(client) = self.coordinator.client() {
            let publishes = [
                (&self.folder_topic, &segment.folder),
                (&self.moment_topic, &segment.moments),
            ];
            for (topic, path) in publishes {
                let payload = Payload::text(path.to_string_lossy());
                if let Err(e) = client.publish(topic, payload, true) {
                    tracing::warn!(%topic, "Failed to publish folder: {}", e);
                }
            }
        }

        *self.current.write() = Some(segment);
    }

    fn escalate(&self, error: &DriveError) {
        if self.escalated.swap(true, Ordering::AcqRel) {
            tracing::debug!("Fleet shutdown already requested: {}", error);
            return;
        }
        tracing::error!("CRITICAL: {}; requesting fleet shutdown", error);
        self.coordinator.request_fleet_shutdown();
    }

    fn active_root_below_floor(&self) -> bool {
        let Some(root) = self.current.read().as_ref().map(|s| s.root.clone()) else {
            return false;
        };
        match self.disk.free_bytes(&root) {
            Ok(free) => free < self.min_free_bytes.load(Ordering::Relaxed),
            Err(e) => {
                tracing::warn!(root = %root.display(), "Cannot query free space: {}", e);
                false
            }
        }
    }

    /// Apply a new configuration to the running watcher.
    ///
    /// A changed roots list replaces the learned priority order. Segment
    /// length and check interval take effect at the next capacity check.
    pub fn apply_config(&self, config: &DriveWatcherConfig) {
        self.min_free_bytes
            .store(config.min_free_bytes, Ordering::Relaxed);
        self.segment_length_secs
            .store(config.segment_length_secs, Ordering::Relaxed);
        self.check_interval_secs
            .store(config.check_interval_secs, Ordering::Relaxed);

        let mut configured = self.configured.lock();
        if *configured != config.roots {
            *configured = config.roots.clone();
            *self.priority.lock() = config.roots.clone();
            tracing::info!(roots = config.roots.len(), "Drive roots changed");
        }
    }

    /// Selector keeping this watcher in sync with `path` of the global
    /// configuration.
    pub fn config_selector(self: &Arc<Self>, path: impl Into<String>) -> DriveWatcherSelector {
        let path = path.into();
        let pattern = format!("/data/{}(/|$)", regex_escape_path(&path));
        DriveWatcherSelector {
            watcher: Arc::downgrade(self),
            path,
            pattern,
        }
    }

    pub fn current_folder(&self) -> Option<PathBuf> {
        self.current.read().as_ref().map(|s| s.folder.clone())
    }

    pub fn current_segment(&self) -> Option<Segment> {
        self.current.read().clone()
    }

    /// Roots in current priority order.
    pub fn priority(&self) -> Vec<PathBuf> {
        self.priority.lock().clone()
    }

    pub fn segments_created(&self) -> u64 {
        self.segments_created.load(Ordering::Relaxed)
    }

    /// Whether a fleet shutdown was requested by this watcher.
    pub fn has_escalated(&self) -> bool {
        self.escalated.load(Ordering::Acquire)
    }

    /// Configuration the watcher was created with.
    pub fn config(&self) -> &DriveWatcherConfig {
        &self.config
    }
}

fn regex_escape_path(path: &str) -> String {
    path.split(['.', '/'])
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.chars()
                .flat_map(|c| {
                    let escape = !c.is_ascii_alphanumeric() && c != '_' && c != '-';
                    escape.then_some('\\').into_iter().chain(std::iter::once(c))
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl ShutdownHandler for DriveWatcher {
    fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.worker.lock().take() {
            join_worker(handle, "drive-watcher");
        }
        tracing::info!(
            segments = self.segments_created(),
            "Drive watcher stopped"
        );
        Ok(())
    }
}

/// Live configuration binding of a [`DriveWatcher`].
pub struct DriveWatcherSelector {
    watcher: Weak<DriveWatcher>,
    path: String,
    pattern: String,
}

impl ConfigSelector for DriveWatcherSelector {
    type Config = DriveWatcherConfig;

    fn select_config(&self, global: &ConfigNode) -> Result<DriveWatcherConfig, ConfigError> {
        global
            .get_path(&self.path)
            .ok_or_else(|| ConfigError::Unresolved {
                path: self.path.clone(),
                reason: "not present in the configuration".into(),
            })?
            .deserialize()
    }

    fn notify_pattern(&self) -> &str {
        &self.pattern
    }

    fn config_has_updated(&self, config: &DriveWatcherConfig) {
        if let Some(watcher) = self.watcher.upgrade() {
            watcher.apply_config(config);
        }
    }
}
