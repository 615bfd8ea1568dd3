//! Change detection for the watched file.
//!
//! notify delivers raw events on its own thread. They are forwarded into a
//! channel and resolved on a dedicated worker, which owns the OS watch and
//! reports one [`WatchEvent`] per settled change. Editors that save by
//! deleting and recreating the file make the path vanish for a moment; the
//! worker waits up to the settle window for it to come back before giving up.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::WatchRegistrationError;

pub const SETTLE_WINDOW: Duration = Duration::from_secs(1);
pub const SETTLE_POLL: Duration = Duration::from_millis(100);

/// The file observed for the whole session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedPath(PathBuf);

impl WatchedPath {
    /// Makes `path` absolute without resolving symlinks, so the name the user
    /// gave is the name that gets watched.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        std::path::absolute(path).map(Self)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl fmt::Display for WatchedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file exists and should be rendered again.
    Settled,
    /// The file vanished and did not come back within the settle window.
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettleConfig {
    /// How long a deleted file may stay absent before the change is dropped.
    pub window: Duration,
    /// Longest gap between existence checks while waiting.
    pub poll: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            window: SETTLE_WINDOW,
            poll: SETTLE_POLL,
        }
    }
}

/// Input of the detector worker.
#[derive(Debug)]
pub enum Signal {
    Raw(notify::Result<notify::Event>),
    Stop,
}

/// The OS watch registration. Only the detector worker calls into it.
pub trait WatchRegistry: Send {
    /// Registers `path`, replacing any earlier registration of it.
    fn arm(&mut self, path: &Path) -> Result<(), WatchRegistrationError>;
}

pub struct NotifyRegistry {
    watcher: RecommendedWatcher,
}

impl NotifyRegistry {
    pub fn new(signals: Sender<Signal>) -> notify::Result<Self> {
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = signals.send(Signal::Raw(res));
            },
            Config::default(),
        )?;
        Ok(Self { watcher })
    }
}

impl WatchRegistry for NotifyRegistry {
    fn arm(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
        // Deletion may already have dropped the old registration.
        let _ = self.watcher.unwatch(path);
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchRegistrationError {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Reads are not changes; our own renders read the file. Metadata changes
/// count: a rename over a file another process holds open only reports an
/// attribute change on the old inode.
fn is_change(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DetectorState {
    Watching,
    Unsettled { since: Instant },
    Stopped,
}

struct Worker<W> {
    path: WatchedPath,
    registry: W,
    config: SettleConfig,
    signals: Receiver<Signal>,
    events: Sender<WatchEvent>,
    state: DetectorState,
    /// Signals read ahead while clearing stale removals, handled next.
    backlog: VecDeque<Signal>,
}

impl<W: WatchRegistry> Worker<W> {
    fn run(mut self) {
        log::debug!("Watching {}", self.path);

        while self.state != DetectorState::Stopped {
            let signal = match self.backlog.pop_front() {
                Some(signal) => Ok(signal),
                None => self.signals.recv(),
            };
            match signal {
                Ok(Signal::Raw(Ok(event))) => self.handle_event(&event),
                Ok(Signal::Raw(Err(err))) => log::warn!("Watch error on {}: {err}", self.path),
                Ok(Signal::Stop) | Err(_) => self.state = DetectorState::Stopped,
            }
        }

        log::debug!("Stopped watching {}", self.path);
    }

    fn handle_event(&mut self, event: &notify::Event) {
        if !is_change(&event.kind) {
            log::trace!("Ignoring {:?} on {}", event.kind, self.path);
            return;
        }
        log::debug!("Change {:?} on {}", event.kind, self.path);

        if self.path.exists() {
            let outcome = self.settle();
            self.emit(outcome);
            self.skip_stale_removals();
            return;
        }

        log::debug!("{} is gone, waiting for it to reappear", self.path);
        self.state = DetectorState::Unsettled {
            since: Instant::now(),
        };
        if let Some(outcome) = self.wait_for_reappearance() {
            self.emit(outcome);
        }
    }

    /// Replacing the file reports the old inode's removal after the change
    /// itself. Re-arming waits for the backend to deliver those, so removals
    /// queued now while the path exists describe the inode no longer watched.
    /// Everything else is kept for the main loop.
    fn skip_stale_removals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                Signal::Stop => {
                    self.state = DetectorState::Stopped;
                    return;
                }
                Signal::Raw(Ok(event))
                    if matches!(event.kind, EventKind::Remove(_)) && self.path.exists() =>
                {
                    log::trace!("Skipping removal of replaced {}", self.path);
                }
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Blocks until the path is back, the window runs out, or a stop arrives.
    /// Raw events received meanwhile belong to the same save and are absorbed.
    fn wait_for_reappearance(&mut self) -> Option<WatchEvent> {
        let DetectorState::Unsettled { since } = self.state else {
            return None;
        };
        // Anything read ahead belongs to this save.
        self.backlog.clear();

        loop {
            if self.path.exists() {
                log::debug!("{} reappeared after {:?}", self.path, since.elapsed());
                let outcome = self.settle();
                return self.absorb_pending().then_some(outcome);
            }

            let waited = since.elapsed();
            if waited >= self.config.window {
                log::debug!("{} did not reappear within {:?}", self.path, self.config.window);
                self.state = DetectorState::Watching;
                return Some(WatchEvent::Dropped);
            }

            let timeout = self.config.poll.min(self.config.window - waited);
            match self.signals.recv_timeout(timeout) {
                Ok(Signal::Raw(Ok(event))) => {
                    log::trace!("Absorbed {:?} while unsettled", event.kind);
                }
                Ok(Signal::Raw(Err(err))) => log::warn!("Watch error on {}: {err}", self.path),
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    self.state = DetectorState::Stopped;
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Discards raw events already queued for the save that just settled.
    /// Returns false if a stop was among them.
    fn absorb_pending(&mut self) -> bool {
        while let Ok(signal) = self.signals.try_recv() {
            if let Signal::Stop = signal {
                self.state = DetectorState::Stopped;
                return false;
            }
        }
        true
    }

    /// Re-arms the watch; deletion or replacement may have invalidated it.
    fn settle(&mut self) -> WatchEvent {
        self.state = DetectorState::Watching;
        match self.registry.arm(self.path.as_path()) {
            Ok(()) => WatchEvent::Settled,
            Err(err) => {
                log::warn!("{err}: {}", err.source);
                WatchEvent::Dropped
            }
        }
    }

    fn emit(&mut self, event: WatchEvent) {
        if self.events.send(event).is_err() {
            self.state = DetectorState::Stopped;
        }
    }
}

/// Handle to the detector worker. Dropping it stops the worker.
pub struct ChangeDetector {
    signals: Sender<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl ChangeDetector {
    /// Arms `path` once on the calling thread, then hands the registry to a
    /// worker thread. `make_registry` receives the sender raw events go to.
    pub fn spawn_with<W, F>(
        path: WatchedPath,
        config: SettleConfig,
        make_registry: F,
    ) -> Result<(Self, Receiver<WatchEvent>), WatchRegistrationError>
    where
        W: WatchRegistry + 'static,
        F: FnOnce(Sender<Signal>) -> notify::Result<W>,
    {
        let (signal_tx, signal_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let registration_error = |source| WatchRegistrationError {
            path: path.as_path().to_path_buf(),
            source,
        };

        let mut registry = make_registry(signal_tx.clone()).map_err(registration_error)?;
        registry.arm(path.as_path())?;

        let worker = Worker {
            path: path.clone(),
            registry,
            config,
            signals: signal_rx,
            events: event_tx,
            state: DetectorState::Watching,
            backlog: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("mdlive-watch".to_string())
            .spawn(move || worker.run())
            .map_err(|err| registration_error(notify::Error::io(err)))?;

        Ok((
            Self {
                signals: signal_tx,
                worker: Some(handle),
            },
            event_rx,
        ))
    }

    /// Stops the worker and waits for it, interrupting a settle wait.
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        let _ = self.signals.send(Signal::Stop);
        if handle.join().is_err() {
            log::warn!("Watch worker panicked");
        }
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind};
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct FakeRegistry {
        armed: Arc<Mutex<Vec<PathBuf>>>,
        refuse_after: Option<usize>,
    }

    impl FakeRegistry {
        fn arm_count(&self) -> usize {
            self.armed.lock().unwrap().len()
        }
    }

    impl WatchRegistry for FakeRegistry {
        fn arm(&mut self, path: &Path) -> Result<(), WatchRegistrationError> {
            let mut armed = self.armed.lock().unwrap();
            if self.refuse_after.is_some_and(|limit| armed.len() >= limit) {
                return Err(WatchRegistrationError {
                    path: path.to_path_buf(),
                    source: notify::Error::generic("refused"),
                });
            }
            armed.push(path.to_path_buf());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        path: PathBuf,
        registry: FakeRegistry,
        detector: ChangeDetector,
        events: Receiver<WatchEvent>,
        raw: Sender<Signal>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_registry(FakeRegistry::default())
        }

        fn with_registry(registry: FakeRegistry) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("doc.md");
            fs::write(&path, "# Start\n").unwrap();

            let mut raw = None;
            let fake = registry.clone();
            let (detector, events) = ChangeDetector::spawn_with(
                WatchedPath::new(&path).unwrap(),
                SettleConfig::default(),
                |signals| {
                    raw = Some(signals);
                    Ok(fake)
                },
            )
            .unwrap();

            Self {
                _dir: dir,
                path,
                registry,
                detector,
                events,
                raw: raw.unwrap(),
            }
        }

        fn send(&self, kind: EventKind) {
            let event = notify::Event::new(kind).add_path(self.path.clone());
            self.raw.send(Signal::Raw(Ok(event))).unwrap();
        }
    }

    fn modify() -> EventKind {
        EventKind::Modify(ModifyKind::Data(DataChange::Any))
    }

    fn remove() -> EventKind {
        EventKind::Remove(RemoveKind::File)
    }

    fn create() -> EventKind {
        EventKind::Create(CreateKind::File)
    }

    #[test]
    fn spawn_arms_the_path_once() {
        let harness = Harness::new();
        assert_eq!(harness.registry.arm_count(), 1);
        assert_eq!(harness.registry.armed.lock().unwrap()[0], harness.path);
    }

    #[test]
    fn each_change_to_existing_file_settles_immediately() {
        let harness = Harness::new();
        for _ in 0..3 {
            let started = Instant::now();
            harness.send(modify());
            let event = harness.events.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(event, WatchEvent::Settled);
            assert!(started.elapsed() < Duration::from_millis(100));
        }
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        assert_eq!(harness.registry.arm_count(), 4);
    }

    #[test]
    fn access_events_are_ignored() {
        let harness = Harness::new();
        harness.send(EventKind::Access(AccessKind::Any));
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(300))
            .is_err());
        assert_eq!(harness.registry.arm_count(), 1);
    }

    #[test]
    fn metadata_change_settles() {
        let harness = Harness::new();
        harness.send(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)));
        assert_eq!(
            harness.events.recv_timeout(Duration::from_secs(1)).unwrap(),
            WatchEvent::Settled
        );
        assert_eq!(harness.registry.arm_count(), 2);
    }

    #[test]
    fn watch_errors_are_skipped() {
        let harness = Harness::new();
        harness
            .raw
            .send(Signal::Raw(Err(notify::Error::generic("boom"))))
            .unwrap();
        harness.send(modify());
        assert_eq!(
            harness.events.recv_timeout(Duration::from_secs(1)).unwrap(),
            WatchEvent::Settled
        );
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn delete_and_recreate_settles_once_and_rearms() {
        let harness = Harness::new();
        fs::remove_file(&harness.path).unwrap();

        let started = Instant::now();
        harness.send(remove());

        let path = harness.path.clone();
        let raw = harness.raw.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            // Queued first so it is absorbed by the wait, not seen afterwards.
            let event =
                notify::Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
            let _ = raw.send(Signal::Raw(Ok(event)));
            fs::write(&path, "# Recreated\n").unwrap();
        });

        let event = harness.events.recv_timeout(Duration::from_secs(2)).unwrap();
        let elapsed = started.elapsed();
        writer.join().unwrap();

        assert_eq!(event, WatchEvent::Settled);
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
        assert_eq!(fs::read_to_string(&harness.path).unwrap(), "# Recreated\n");
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(1200))
            .is_err());
        assert_eq!(harness.registry.arm_count(), 2);
    }

    #[test]
    fn events_during_settle_wait_are_absorbed() {
        let harness = Harness::new();
        fs::remove_file(&harness.path).unwrap();
        harness.send(remove());
        harness.send(remove());
        harness.send(create());

        thread::sleep(Duration::from_millis(150));
        fs::write(&harness.path, "back").unwrap();

        assert_eq!(
            harness.events.recv_timeout(Duration::from_secs(2)).unwrap(),
            WatchEvent::Settled
        );
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(1200))
            .is_err());
    }

    #[test]
    fn missing_file_drops_after_window() {
        let harness = Harness::new();
        fs::remove_file(&harness.path).unwrap();

        let started = Instant::now();
        harness.send(remove());

        let event = harness.events.recv_timeout(Duration::from_secs(3)).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(event, WatchEvent::Dropped);
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1150), "{elapsed:?}");

        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(300))
            .is_err());
        assert_eq!(harness.registry.arm_count(), 1);
    }

    #[test]
    fn rearm_failure_is_reported_as_dropped() {
        let harness = Harness::with_registry(FakeRegistry {
            refuse_after: Some(1),
            ..FakeRegistry::default()
        });
        harness.send(modify());
        assert_eq!(
            harness.events.recv_timeout(Duration::from_secs(1)).unwrap(),
            WatchEvent::Dropped
        );
    }

    #[test]
    fn initial_registration_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = WatchedPath::new(dir.path().join("doc.md")).unwrap();
        let result = ChangeDetector::spawn_with(path.clone(), SettleConfig::default(), |_| {
            Ok(FakeRegistry {
                refuse_after: Some(0),
                ..FakeRegistry::default()
            })
        });
        let Err(err) = result else {
            panic!("registration should fail");
        };
        assert_eq!(err.path, path.as_path());
    }

    #[test]
    fn stop_interrupts_settle_wait() {
        let mut harness = Harness::new();
        fs::remove_file(&harness.path).unwrap();
        harness.send(remove());
        thread::sleep(Duration::from_millis(150));

        let started = Instant::now();
        harness.detector.stop();
        assert!(started.elapsed() < Duration::from_millis(500));

        assert!(matches!(
            harness.events.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut harness = Harness::new();
        harness.detector.stop();
        harness.detector.stop();
    }

    struct Native {
        _dir: TempDir,
        path: PathBuf,
        _detector: ChangeDetector,
        events: Receiver<WatchEvent>,
    }

    impl Native {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("doc.md");
            fs::write(&path, "one").unwrap();

            let (detector, events) = ChangeDetector::spawn_with(
                WatchedPath::new(&path).unwrap(),
                SettleConfig::default(),
                NotifyRegistry::new,
            )
            .unwrap();
            thread::sleep(Duration::from_millis(100));

            Self {
                _dir: dir,
                path,
                _detector: detector,
                events,
            }
        }

        /// Writes `contents` beside the file and renames it over the path.
        fn replace(&self, contents: &str) {
            let tmp = self.path.with_extension("md.tmp");
            fs::write(&tmp, contents).unwrap();
            fs::rename(&tmp, &self.path).unwrap();
        }

        fn expect_settled(&self) {
            assert_eq!(
                self.events.recv_timeout(Duration::from_secs(3)),
                Ok(WatchEvent::Settled)
            );
        }

        fn expect_quiet(&self) {
            let next = self.events.recv_timeout(Duration::from_millis(1200));
            assert!(next.is_err(), "unexpected {next:?}");
        }
    }

    #[test]
    fn native_watcher_reports_writes() {
        let native = Native::new();
        fs::write(&native.path, "two").unwrap();
        native.expect_settled();
    }

    #[test]
    fn native_delete_and_recreate_settles_once() {
        let native = Native::new();
        let tmp = native.path.with_extension("md.tmp");
        fs::write(&tmp, "two").unwrap();

        fs::remove_file(&native.path).unwrap();
        thread::sleep(Duration::from_millis(300));
        fs::rename(&tmp, &native.path).unwrap();

        native.expect_settled();
        native.expect_quiet();
    }

    #[test]
    fn native_rename_over_settles_once_and_follows_new_file() {
        let native = Native::new();
        native.replace("two");
        native.expect_settled();
        native.expect_quiet();

        fs::write(&native.path, "three").unwrap();
        native.expect_settled();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn native_rename_over_open_file_settles_once() {
        let native = Native::new();
        let held = fs::File::open(&native.path).unwrap();

        native.replace("two");
        native.expect_settled();
        native.expect_quiet();

        fs::write(&native.path, "three").unwrap();
        native.expect_settled();
        drop(held);
    }

    #[test]
    fn native_permission_change_settles() {
        let native = Native::new();
        let mut permissions = fs::metadata(&native.path).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(&native.path, permissions).unwrap();
        native.expect_settled();
    }

    #[test]
    fn watched_path_is_absolute() {
        let path = WatchedPath::new("notes.md").unwrap();
        assert!(path.as_path().is_absolute());
        assert!(path.as_path().ends_with("notes.md"));
    }
}
