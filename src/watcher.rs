use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::models::parse_filename;
use crate::pipeline::{is_ledger_file, Pipeline};
use crate::report;
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injected time source so stability checks and the debounce window are
/// deterministic under test.
pub trait Clock {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

fn now_secs(clock: &dyn Clock) -> u64 {
    clock
        .now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// File state machine
// ---------------------------------------------------------------------------

/// UNSEEN → STABLE → PROCESSING → ARCHIVED_SUCCESS | ARCHIVED_ERROR.
/// The archived states are terminal and physical: the file is moved out of
/// the watch tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Unseen,
    Stable,
    Processing,
    ArchivedSuccess,
    ArchivedError,
}

/// Stability predicate: a file is fully written once its size stops
/// changing between two samples.
pub fn is_stable(prev_size: u64, curr_size: u64) -> bool {
    prev_size == curr_size
}

/// Sample the file size across a pause, retrying a bounded number of times.
/// Exists specifically to avoid reading a partially-written upload.
pub fn wait_until_stable(path: &Path, clock: &dyn Clock, pause: Duration, retries: u32) -> bool {
    let Ok(mut prev) = std::fs::metadata(path).map(|m| m.len()) else {
        return false;
    };
    for _ in 0..retries.max(1) {
        clock.sleep(pause);
        let Ok(curr) = std::fs::metadata(path).map(|m| m.len()) else {
            return false;
        };
        if is_stable(prev, curr) {
            return true;
        }
        prev = curr;
    }
    false
}

// ---------------------------------------------------------------------------
// Archiving
// ---------------------------------------------------------------------------

/// Move a processed file to its terminal location: the department's archive
/// folder on success, the flat error folder otherwise.
pub fn archive_file(path: &Path, settings: &Settings, success: bool) -> FileState {
    let dest_dir = if success {
        match parse_filename(path) {
            Some(meta) => settings.archive_dir().join(meta.department),
            None => settings.archive_dir().join("unknown"),
        }
    } else {
        settings.error_dir()
    };
    let state = if success {
        FileState::ArchivedSuccess
    } else {
        FileState::ArchivedError
    };

    if let Err(e) = std::fs::create_dir_all(&dest_dir) {
        log::error!("archive dir {} not creatable: {e}", dest_dir.display());
        return state;
    }
    let dest = dest_dir.join(path.file_name().unwrap_or_default());
    if let Err(e) = std::fs::rename(path, &dest) {
        // Cross-device moves fall back to copy + remove
        match std::fs::copy(path, &dest).and_then(|_| std::fs::remove_file(path)) {
            Ok(_) => {}
            Err(e2) => log::error!("archive of {} failed: {e} / {e2}", path.display()),
        }
    }
    log::info!("archived {} → {}", path.display(), dest.display());
    state
}

// ---------------------------------------------------------------------------
// Watcher loop
// ---------------------------------------------------------------------------

/// Polling watcher: scans the watch tree at a fixed interval, pushes stable
/// new or changed files through the pipeline strictly sequentially, and
/// archives each outcome. Only the external stop flag ends the loop.
pub struct Watcher<'a> {
    clock: &'a dyn Clock,
    processed: HashMap<PathBuf, SystemTime>,
    states: HashMap<PathBuf, FileState>,
}

impl<'a> Watcher<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            processed: HashMap::new(),
            states: HashMap::new(),
        }
    }

    /// Last observed state of a path, keyed by its pre-archive location.
    #[allow(dead_code)]
    pub fn state(&self, path: &Path) -> Option<FileState> {
        self.states.get(path).copied()
    }

    /// One pass over the watch tree. Returns how many files were processed.
    pub fn scan_once(&mut self, pipeline: &mut Pipeline) -> usize {
        let settings = pipeline.settings().clone();
        let output_dir = settings.output_dir();
        let archive_dir = settings.archive_dir();
        let dict_dir = settings.dict_dir();

        let mut candidates: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in WalkDir::new(settings.watch_dir())
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.starts_with(&output_dir)
                || path.starts_with(&archive_dir)
                || path.starts_with(&dict_dir)
                || !is_ledger_file(path)
            {
                continue;
            }
            let Some(mtime) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };
            if self
                .processed
                .get(path)
                .map(|prev| mtime <= *prev)
                .unwrap_or(false)
            {
                continue;
            }
            candidates.push((path.to_path_buf(), mtime));
        }

        let mut handled = 0;
        for (path, mtime) in candidates {
            self.states.entry(path.clone()).or_insert(FileState::Unseen);
            if !wait_until_stable(
                &path,
                self.clock,
                Duration::from_secs(settings.stability_pause_secs),
                settings.stability_retries,
            ) {
                log::info!("still being written, skipped: {}", path.display());
                continue;
            }
            self.states.insert(path.clone(), FileState::Stable);
            self.states.insert(path.clone(), FileState::Processing);
            let state = match pipeline.process_file(&path) {
                Ok(count) => {
                    log::info!("{} → {count} records", path.display());
                    archive_file(&path, &settings, true)
                }
                Err(e) => {
                    let class = if e.is_structural() { "structural" } else { "io" };
                    log::error!("{} failed ({class}): {e}", path.display());
                    archive_file(&path, &settings, false)
                }
            };
            self.states.insert(path.clone(), state);
            self.processed.insert(path, mtime);
            handled += 1;
        }
        handled
    }

    /// Run until the stop flag is raised. Files already present at startup
    /// are swept on the first pass.
    pub fn run(&mut self, pipeline: &mut Pipeline, stop: &AtomicBool) {
        log::info!(
            "watching {} every {}s",
            pipeline.settings().watch_dir().display(),
            pipeline.settings().poll_interval_secs
        );
        while !stop.load(Ordering::Relaxed) {
            self.scan_once(pipeline);
            let interval = Duration::from_secs(pipeline.settings().poll_interval_secs);
            self.clock.sleep(interval);
        }
        log::info!("watcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Debounced merge task
// ---------------------------------------------------------------------------

/// Pure debounce predicate: merge when the marker is newer than the last
/// merge and has sat quiet for the whole cooldown window.
pub fn merge_due(marker: u64, last_merged: u64, now: u64, cooldown: u64) -> bool {
    marker > last_merged && now.saturating_sub(marker) >= cooldown
}

/// The quiescence loop: watches the shared last-write marker and triggers a
/// full company-wide re-aggregation once updates go quiet. Trades immediacy
/// for eventual consistency of the merged reports.
pub fn run_merge_loop(settings: Settings, clock: &dyn Clock, stop: &AtomicBool) {
    let out_root = settings.output_dir();
    let mut last_merged: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        if let Some(marker) = report::read_last_updated(&out_root) {
            let now = now_secs(clock);
            if merge_due(marker, last_merged, now, settings.merge_cooldown_secs) {
                log::info!("cooldown elapsed, regenerating company rollup");
                if let Err(e) = report::merge_all(&out_root) {
                    log::error!("company rollup failed: {e}");
                }
                last_merged = now;
            }
        }
        clock.sleep(Duration::from_secs(settings.merge_poll_secs));
    }
}

/// Spawn the merge loop on its own thread; it shares only the marker file
/// and the output directory with the main loop.
pub fn spawn_merge_task(settings: Settings, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        run_merge_loop(settings, &SystemClock, &stop);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::NullOracle;
    use std::cell::Cell;

    /// Clock whose time only moves when the test says so.
    struct FakeClock {
        now: Cell<u64>,
    }

    impl FakeClock {
        fn new(start: u64) -> Self {
            Self {
                now: Cell::new(start),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(self.now.get())
        }

        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration.as_secs());
        }
    }

    fn test_settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.watch_dir = root.to_string_lossy().to_string();
        settings.stability_pause_secs = 0;
        settings
    }

    #[test]
    fn test_is_stable() {
        assert!(is_stable(100, 100));
        assert!(!is_stable(100, 200));
    }

    #[test]
    fn test_wait_until_stable_static_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "金額\n100\n").unwrap();
        let clock = FakeClock::new(0);
        assert!(wait_until_stable(&path, &clock, Duration::from_secs(1), 3));
    }

    #[test]
    fn test_wait_until_stable_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::new(0);
        assert!(!wait_until_stable(
            &dir.path().join("gone.csv"),
            &clock,
            Duration::from_secs(1),
            3
        ));
    }

    #[test]
    fn test_merge_due() {
        // Marker newer than last merge, cooldown elapsed
        assert!(merge_due(100, 0, 120, 15));
        // Cooldown not yet elapsed
        assert!(!merge_due(100, 0, 110, 15));
        // Marker older than the last merge
        assert!(!merge_due(100, 150, 200, 15));
    }

    #[test]
    fn test_scan_archives_valid_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        std::fs::write(
            dir.path().join("営業部_株式会社Forneeds_2025年1月.csv"),
            "納品日,品名,金額\n5/3,ロール紙,1000\n",
        )
        .unwrap();

        let clock = FakeClock::new(0);
        let mut watcher = Watcher::new(&clock);
        assert_eq!(watcher.scan_once(&mut pipeline), 1);

        // Source gone, archived under the department folder
        let source = dir.path().join("営業部_株式会社Forneeds_2025年1月.csv");
        assert!(!source.exists());
        assert!(settings
            .archive_dir()
            .join("営業部")
            .join("営業部_株式会社Forneeds_2025年1月.csv")
            .exists());
        assert_eq!(watcher.state(&source), Some(FileState::ArchivedSuccess));
    }

    #[test]
    fn test_scan_archives_bad_filename_to_error_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        std::fs::write(dir.path().join("売上メモ.csv"), "日付,金額\n5/3,100\n").unwrap();

        let clock = FakeClock::new(0);
        let mut watcher = Watcher::new(&clock);
        watcher.scan_once(&mut pipeline);

        assert!(settings.error_dir().join("売上メモ.csv").exists());
        assert_eq!(
            watcher.state(&dir.path().join("売上メモ.csv")),
            Some(FileState::ArchivedError)
        );
        // Structural error: zero records, no per-department artifact
        assert!(!settings.output_dir().join("営業部").exists());
    }

    #[test]
    fn test_scan_skips_already_processed_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline = Pipeline::with_oracle(settings, Box::new(NullOracle)).unwrap();
        std::fs::write(
            dir.path().join("営業部_株式会社Forneeds_2025年1月.csv"),
            "納品日,品名,金額\n5/3,ロール紙,1000\n",
        )
        .unwrap();

        let clock = FakeClock::new(0);
        let mut watcher = Watcher::new(&clock);
        assert_eq!(watcher.scan_once(&mut pipeline), 1);
        // File was archived away; nothing left to process
        assert_eq!(watcher.scan_once(&mut pipeline), 0);
    }

    #[test]
    fn test_generated_outputs_not_reprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        std::fs::write(
            dir.path().join("営業部_株式会社Forneeds_2025年1月.csv"),
            "納品日,品名,金額\n5/3,ロール紙,1000\n",
        )
        .unwrap();

        let clock = FakeClock::new(0);
        let mut watcher = Watcher::new(&clock);
        watcher.scan_once(&mut pipeline);
        // The generated per-department CSV sits under output/ and must not
        // be picked up as a new ledger file on the next pass.
        assert_eq!(watcher.scan_once(&mut pipeline), 0);
    }
}
