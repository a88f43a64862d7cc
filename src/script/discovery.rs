//! Script discovery.
//!
//! Discovery runs once per backup cycle, at the start of the freeze phase.
//! It lists the script directory (no recursion), keeps regular files only,
//! and sorts them lexicographically ascending so operators can order
//! scripts with numeric prefixes (`10-app.sh`, `20-db.sh`). The resulting
//! list is shared by the freeze, thaw, and freeze-fail phase operations
//! and destroyed only when the backup cycle's state is released.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::config::LegacyScripts;
use crate::script::executor::ScriptPhase;

/// Where a script entry's executable comes from
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// A file discovered in the script directory
    Discovered(PathBuf),
    /// The legacy pre-freeze/post-thaw pair; the phase picks the path
    Legacy {
        /// Run during freeze and freeze-fail
        freeze: PathBuf,
        /// Run during thaw
        thaw: PathBuf,
    },
}

/// One script slot in the ordered list
#[derive(Debug)]
pub struct ScriptEntry {
    source: ScriptSource,
    child: Option<Child>,
}

impl ScriptEntry {
    fn new(source: ScriptSource) -> Self {
        Self {
            source,
            child: None,
        }
    }

    /// Path to invoke for the given phase
    pub fn path_for(&self, phase: ScriptPhase) -> &Path {
        match &self.source {
            ScriptSource::Discovered(path) => path,
            ScriptSource::Legacy { freeze, thaw } => match phase {
                ScriptPhase::Thaw => thaw,
                ScriptPhase::Freeze | ScriptPhase::FreezeFail => freeze,
            },
        }
    }
}

/// The ordered script list for one backup cycle.
///
/// The cursor marks the entry currently executing: `-1` is before the
/// first entry, `len` is past the last. The freeze phase moves it forward
/// and leaves it past the end (or at the failed index); thaw and
/// freeze-fail resume from wherever the previous phase left it and move
/// backward. Children are spawned with kill-on-drop, so dropping the set
/// can never leak a running quiesce script.
#[derive(Debug)]
pub struct ScriptSet {
    entries: Vec<ScriptEntry>,
    cursor: isize,
    thaw_failed: bool,
}

/// Script set shared between the phase operations of one cycle
pub type SharedScriptSet = Arc<Mutex<ScriptSet>>;

impl ScriptSet {
    fn new(entries: Vec<ScriptEntry>) -> Self {
        Self {
            entries,
            cursor: -1,
            thaw_failed: false,
        }
    }

    /// Number of script slots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no scripts
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current cursor position
    pub fn cursor(&self) -> isize {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: isize) {
        self.cursor = cursor;
    }

    /// Index of the entry under the cursor, if it points at one
    pub fn cursor_index(&self) -> Option<usize> {
        if self.cursor >= 0 && (self.cursor as usize) < self.entries.len() {
            Some(self.cursor as usize)
        } else {
            None
        }
    }

    /// Whether any thaw or freeze-fail script failed during this cycle
    pub fn thaw_failed(&self) -> bool {
        self.thaw_failed
    }

    pub(crate) fn mark_thaw_failed(&mut self) {
        self.thaw_failed = true;
    }

    pub(crate) fn path_at(&self, idx: usize, phase: ScriptPhase) -> PathBuf {
        self.entries[idx].path_for(phase).to_path_buf()
    }

    pub(crate) fn attach_child(&mut self, idx: usize, child: Child) {
        self.entries[idx].child = Some(child);
    }

    /// Poll the child at `idx` without blocking. `None` means no process
    /// handle is attached there; a reaped exit status detaches the handle.
    pub(crate) fn poll_child(&mut self, idx: usize) -> Option<std::io::Result<Option<ExitStatus>>> {
        let entry = self.entries.get_mut(idx)?;
        let child = entry.child.as_mut()?;
        let result = child.try_wait();
        if matches!(result, Ok(Some(_))) {
            entry.child = None;
        }
        Some(result)
    }

    /// Signal the child at `idx` to die, if one is running
    pub(crate) fn kill_child_at(&mut self, idx: usize) -> std::io::Result<()> {
        match self.entries.get_mut(idx).and_then(|e| e.child.as_mut()) {
            Some(child) => child.start_kill(),
            None => Ok(()),
        }
    }

    /// Paths of every entry as resolved for the given phase, in list order
    pub fn paths_for(&self, phase: ScriptPhase) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|entry| entry.path_for(phase).to_path_buf())
            .collect()
    }
}

/// Build the script list for one backup cycle.
///
/// A missing or unreadable directory yields an empty set; a guest with no
/// quiesce scripts is a normal configuration, not an error. The legacy
/// pair, when configured, becomes the first entry so its freeze script
/// runs before every directory script and its thaw script after them.
pub fn discover(dir: &Path, legacy: Option<&LegacyScripts>) -> ScriptSet {
    let mut entries = Vec::new();

    if let Some(legacy) = legacy {
        entries.push(ScriptEntry::new(ScriptSource::Legacy {
            freeze: legacy.freeze.clone(),
            thaw: legacy.thaw.clone(),
        }));
    }

    let mut discovered = list_scripts(dir);
    discovered.sort();
    entries.extend(
        discovered
            .into_iter()
            .map(|path| ScriptEntry::new(ScriptSource::Discovered(path))),
    );

    debug!(
        dir = %dir.display(),
        scripts = entries.len(),
        "built quiesce script list"
    );
    ScriptSet::new(entries)
}

fn list_scripts(dir: &Path) -> Vec<PathBuf> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) => {
            debug!(
                dir = %dir.display(),
                error = %err,
                "script directory unavailable, continuing with no scripts"
            );
            return Vec::new();
        }
    };

    let mut paths = Vec::new();
    for entry in reader {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        // metadata() follows symlinks, so a link to a regular file counts.
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => paths.push(path),
            Ok(_) => debug!(path = %path.display(), "skipping non-regular entry"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable entry")
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn test_discover_sorts_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "20-db.sh");
        touch(dir.path(), "10-app.sh");
        touch(dir.path(), "15-cache.sh");

        let set = discover(dir.path(), None);
        let names: Vec<String> = set
            .paths_for(ScriptPhase::Freeze)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10-app.sh", "15-cache.sh", "20-db.sh"]);
    }

    #[test]
    fn test_discover_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "10-app.sh");
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let set = discover(dir.path(), None);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir");
        let set = discover(&missing, None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_legacy_pair_is_first_and_phase_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "10-app.sh");

        let legacy = LegacyScripts {
            freeze: PathBuf::from("/opt/legacy/pre-freeze"),
            thaw: PathBuf::from("/opt/legacy/post-thaw"),
        };
        let set = discover(dir.path(), Some(&legacy));
        assert_eq!(set.len(), 2);

        let freeze_paths = set.paths_for(ScriptPhase::Freeze);
        assert_eq!(freeze_paths[0], PathBuf::from("/opt/legacy/pre-freeze"));

        let thaw_paths = set.paths_for(ScriptPhase::Thaw);
        assert_eq!(thaw_paths[0], PathBuf::from("/opt/legacy/post-thaw"));

        let fail_paths = set.paths_for(ScriptPhase::FreezeFail);
        assert_eq!(fail_paths[0], PathBuf::from("/opt/legacy/pre-freeze"));
    }

    #[test]
    fn test_cursor_starts_before_first() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "10-app.sh");
        let set = discover(dir.path(), None);
        assert_eq!(set.cursor(), -1);
        assert!(set.cursor_index().is_none());
    }

    proptest! {
        // Invocation order must be the sorted filename order no matter
        // what order the filesystem hands entries back in.
        #[test]
        fn prop_discovery_order_is_sorted(names in proptest::collection::hash_set("[a-z0-9]{1,12}", 0..12)) {
            let dir = tempfile::tempdir().unwrap();
            for name in &names {
                File::create(dir.path().join(name)).unwrap();
            }

            let set = discover(dir.path(), None);
            let discovered: Vec<String> = set
                .paths_for(ScriptPhase::Freeze)
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();

            let mut expected: Vec<String> = names.iter().cloned().collect();
            expected.sort();
            prop_assert_eq!(discovered, expected);
        }
    }
}
