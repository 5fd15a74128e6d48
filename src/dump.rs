use std::{
    path::PathBuf,
    sync::mpsc::{self, Sender},
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{debug, info, warn};

/// A garbage heap that spawns another thread and sends it paths to delete.
/// The `DryRun` variant turns every deletion into a log message instead.
pub enum Dump {
    Real {
        /// handle for spawned thread, returning the number of files removed
        handle: JoinHandle<usize>,

        /// channel for sending paths to be deleted
        sender: Sender<PathBuf>,
    },
    DryRun,
}

impl Dump {
    pub fn new(dry_run: bool) -> Self {
        if dry_run {
            return Self::DryRun;
        }
        let (sender, receiver) = mpsc::channel::<PathBuf>();
        let handle = thread::spawn(move || {
            let mut removed = 0;
            for path in receiver {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!("removed {}", path.display());
                        removed += 1;
                    }
                    Err(e) => warn!("failed to remove {}: {e}", path.display()),
                }
            }
            removed
        });
        Self::Real { handle, sender }
    }

    pub fn send(&self, path: PathBuf) {
        match self {
            Dump::Real { sender, .. } => {
                // the receiver only goes away if the thread panicked, and
                // shutdown reports that
                let _ = sender.send(path);
            }
            Dump::DryRun => info!("would remove {}", path.display()),
        }
    }

    /// wait for every queued deletion to finish and return how many files
    /// were removed
    pub fn shutdown(self) -> usize {
        let Self::Real { handle, sender } = self else {
            return 0;
        };
        let now = Instant::now();
        drop(sender);
        match handle.join() {
            Ok(removed) => {
                debug!(
                    "finished removing {removed} files after {:.1} s",
                    now.elapsed().as_millis() as f64 / 1000.0
                );
                removed
            }
            Err(_) => {
                warn!("file removal thread panicked");
                0
            }
        }
    }
}
