//! Filesystem change watching for development-mode hot reload
//!
//! A [`ChangeWatcher`] registers one watch handle per directory derived
//! from the configured patterns and answers, on demand, whether changes
//! have accumulated since the last check. A check that finds events keeps
//! draining at a fixed debounce interval until a drain comes back empty,
//! so a burst of writes (an editor saving several files) reports as one
//! batch instead of one reload per file. The check is blocking and is
//! meant to run on the blocking pool, never on the async scheduler.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, TryRecvError, channel};
use std::time::Duration;

/// Fixed settle interval between drain attempts while events keep arriving.
pub(crate) const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(200);

/// Path segments that never participate in watching, no matter what the
/// configured patterns match.
const EXCLUDED_SEGMENTS: &[&str] = &["/target/", "/.git/"];

/// Outcome of a [`ChangeWatcher::poll_changes`] check
#[derive(Debug)]
pub enum ChangeOutcome {
    /// Nothing happened since the last check (or the watch channel closed).
    NoChanges,
    /// The accumulated, debounced batch of filesystem events.
    Changed(Vec<Event>),
}

/// A filesystem root plus the directories being watched under it
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    root: PathBuf,
    directories: Vec<PathBuf>,
}

impl WatchRegistration {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

/// Monitors a set of filesystem roots and decides when accumulated
/// changes warrant a reload
pub struct ChangeWatcher {
    // Held for the lifetime of the watcher; dropping it cancels all
    // handles. The backend handle is not Sync, so it sits behind a lock
    // even though nothing touches it after registration.
    _watcher: Mutex<RecommendedWatcher>,
    events: Mutex<Receiver<Event>>,
    registrations: Vec<WatchRegistration>,
}

enum Drained {
    Open,
    Closed,
}

impl ChangeWatcher {
    /// Watch every directory under `roots` that matches `patterns`.
    ///
    /// An empty pattern list watches each root directly.
    pub fn new(roots: &[PathBuf], patterns: &[String]) -> Result<Self, notify::Error> {
        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(error) => tracing::error!("watch error: {}", error),
            },
            Config::default(),
        )?;

        let mut registrations = Vec::new();
        for root in roots {
            let directories = matching_directories(root, patterns);
            for directory in &directories {
                watcher.watch(directory, RecursiveMode::NonRecursive)?;
                tracing::debug!(path = ?directory, "watch registered");
            }
            registrations.push(WatchRegistration {
                root: root.clone(),
                directories,
            });
        }

        Ok(Self {
            _watcher: Mutex::new(watcher),
            events: Mutex::new(rx),
            registrations,
        })
    }

    pub fn registrations(&self) -> &[WatchRegistration] {
        &self.registrations
    }

    /// Drain pending events and, if any were found, debounce until the
    /// burst settles. Closure of the watch channel mid-check fails open
    /// and reports no changes.
    pub fn poll_changes(&self) -> ChangeOutcome {
        let mut batch = Vec::new();
        if let Drained::Closed = self.drain(&mut batch) {
            return ChangeOutcome::NoChanges;
        }
        if batch.is_empty() {
            return ChangeOutcome::NoChanges;
        }

        loop {
            std::thread::sleep(DEBOUNCE_INTERVAL);
            let before = batch.len();
            if let Drained::Closed = self.drain(&mut batch) {
                return ChangeOutcome::NoChanges;
            }
            if batch.len() == before {
                break;
            }
        }

        tracing::debug!("{} filesystem event(s) accumulated, reload required", batch.len());
        ChangeOutcome::Changed(batch)
    }

    fn drain(&self, batch: &mut Vec<Event>) -> Drained {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if is_relevant(&event) {
                        batch.push(event);
                    }
                }
                Err(TryRecvError::Empty) => return Drained::Open,
                Err(TryRecvError::Disconnected) => return Drained::Closed,
            }
        }
    }
}

fn is_relevant(event: &Event) -> bool {
    event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()
}

/// Walk `root` and collect the containing directory of every entry that
/// matches one of `patterns`. Directories are watched rather than files
/// because that is what the underlying watch APIs observe.
fn matching_directories(root: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut directories = Vec::new();
    if patterns.is_empty() {
        if root.is_dir() {
            directories.push(root.to_path_buf());
        }
        return directories;
    }
    collect(root, patterns, &mut directories);
    directories.sort();
    directories.dedup();
    directories
}

fn collect(directory: &Path, patterns: &[String], out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if is_excluded(&path) {
                continue;
            }
            if matches_patterns(&path, patterns) {
                out.push(path.clone());
            }
            collect(&path, patterns, out);
        } else if matches_patterns(&path, patterns)
            && let Some(parent) = path.parent()
        {
            out.push(parent.to_path_buf());
        }
    }
}

fn is_excluded(path: &Path) -> bool {
    let normalized = normalize(path);
    EXCLUDED_SEGMENTS
        .iter()
        .any(|segment| normalized.contains(segment))
}

/// A pattern matches when, after separator normalization, the entry path
/// contains it as a case-insensitive substring. Framework-internal
/// locations never match.
pub(crate) fn matches_patterns(path: &Path, patterns: &[String]) -> bool {
    if is_excluded(path) {
        return false;
    }
    let normalized = normalize(path);
    patterns
        .iter()
        .any(|pattern| normalized.contains(&pattern.replace('\\', "/").to_lowercase()))
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pattern_matching_is_case_insensitive_substring() {
        let patterns = vec!["Templates".to_string()];
        assert!(matches_patterns(
            Path::new("/srv/app/templates/index.html"),
            &patterns
        ));
        assert!(matches_patterns(
            Path::new("C:\\srv\\app\\TEMPLATES\\index.html"),
            &patterns
        ));
        assert!(!matches_patterns(Path::new("/srv/app/static/a.css"), &patterns));
    }

    #[test]
    fn internal_locations_never_match() {
        let patterns = vec!["app".to_string()];
        assert!(!matches_patterns(
            Path::new("/srv/app/target/debug/build.rs"),
            &patterns
        ));
        assert!(!matches_patterns(
            Path::new("/srv/app/.git/objects/ab"),
            &patterns
        ));
    }

    #[test]
    fn matching_directories_walks_to_containing_folder() {
        let root = tempfile::tempdir().unwrap();
        let pages = root.path().join("pages");
        fs::create_dir(&pages).unwrap();
        fs::write(pages.join("home.html"), "x").unwrap();
        fs::create_dir(root.path().join("static")).unwrap();

        let directories =
            matching_directories(root.path(), &["home.html".to_string(), "pages".to_string()]);
        assert_eq!(directories, vec![pages]);
    }

    #[test]
    fn burst_reports_as_single_batch() {
        let root = tempfile::tempdir().unwrap();
        let watcher = ChangeWatcher::new(&[root.path().to_path_buf()], &[]).unwrap();

        for i in 0..5 {
            fs::write(root.path().join(format!("file-{i}.txt")), "change").unwrap();
        }
        // Give the backend time to deliver the burst before checking.
        std::thread::sleep(Duration::from_millis(500));

        match watcher.poll_changes() {
            ChangeOutcome::Changed(batch) => assert!(!batch.is_empty()),
            ChangeOutcome::NoChanges => panic!("burst should be reported"),
        }
        // The whole burst was absorbed by the first check.
        assert!(matches!(watcher.poll_changes(), ChangeOutcome::NoChanges));
    }

    #[test]
    fn quiet_watcher_reports_no_changes() {
        let root = tempfile::tempdir().unwrap();
        let watcher = ChangeWatcher::new(&[root.path().to_path_buf()], &[]).unwrap();
        assert!(matches!(watcher.poll_changes(), ChangeOutcome::NoChanges));
    }
}
