use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use crate::error::{ReadError, StartError};
use crate::render::Render;
use crate::viewer::ViewerSink;
use crate::watch::{
    ChangeDetector, NotifyRegistry, SettleConfig, Signal, WatchEvent, WatchRegistry, WatchedPath,
};

/// What a batch of watch events did to the display.
#[derive(Debug)]
pub enum Update {
    Rendered,
    /// The file changed but could not be read; the old document stays up.
    ReadFailed(ReadError),
    /// The file went away; the old document stays up.
    Dropped,
}

/// Ties the watched file, the renderer and the sink together. Lives on the
/// UI thread, so render/display cycles never overlap.
pub struct ViewerController<R, S> {
    path: WatchedPath,
    renderer: R,
    sink: S,
    settle: SettleConfig,
    detector: Option<ChangeDetector>,
    events: Option<Receiver<WatchEvent>>,
}

impl<R: Render, S: ViewerSink> ViewerController<R, S> {
    pub fn new(path: WatchedPath, renderer: R, sink: S, settle: SettleConfig) -> Self {
        Self {
            path,
            renderer,
            sink,
            settle,
            detector: None,
            events: None,
        }
    }

    pub fn path(&self) -> &WatchedPath {
        &self.path
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    #[cfg(test)]
    pub fn is_watching(&self) -> bool {
        self.detector.is_some()
    }

    /// Starts watching the file, then renders and displays it.
    pub fn start(&mut self) -> Result<(), StartError> {
        self.start_with(NotifyRegistry::new)
    }

    pub fn start_with<W, F>(&mut self, make_registry: F) -> Result<(), StartError>
    where
        W: WatchRegistry + 'static,
        F: FnOnce(Sender<Signal>) -> notify::Result<W>,
    {
        // Arm before reading so a save landing between the two is still seen.
        // A read failure wins over a watch failure; the detector stops on drop.
        let armed = ChangeDetector::spawn_with(self.path.clone(), self.settle, make_registry);
        let document = self.renderer.render(self.path.as_path())?;
        let (detector, events) = armed?;
        self.sink.display(document);

        self.detector = Some(detector);
        self.events = Some(events);
        log::info!("Viewing {}", self.path);
        Ok(())
    }

    /// Handles every watch event queued so far without blocking. A burst of
    /// settles is rendered once.
    pub fn pump(&mut self) -> Option<Update> {
        let events = self.events.as_ref()?;

        let mut settled = false;
        let mut dropped = false;
        loop {
            match events.try_recv() {
                Ok(WatchEvent::Settled) => {
                    settled = true;
                    dropped = false;
                }
                Ok(WatchEvent::Dropped) => {
                    settled = false;
                    dropped = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("Watcher for {} stopped unexpectedly", self.path);
                    self.events = None;
                    break;
                }
            }
        }

        if settled {
            Some(self.on_settled())
        } else if dropped {
            self.on_dropped();
            Some(Update::Dropped)
        } else {
            None
        }
    }

    /// Re-renders the file. A failed read leaves the sink untouched.
    pub fn on_settled(&mut self) -> Update {
        match self.renderer.render(self.path.as_path()) {
            Ok(document) => {
                self.sink.display(document);
                Update::Rendered
            }
            Err(err) => {
                log::warn!("{err}: {}", err.source);
                Update::ReadFailed(err)
            }
        }
    }

    /// The file is presumed deleted. The last good render stays displayed.
    pub fn on_dropped(&mut self) {
        log::info!("{} was removed, keeping the last render", self.path);
    }
}

impl<R, S> ViewerController<R, S> {
    /// Stops the detector. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(mut detector) = self.detector.take() {
            detector.stop();
        }
        self.events = None;
    }
}

impl<R, S> Drop for ViewerController<R, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
