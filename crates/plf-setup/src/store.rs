//! Run manifest persistence
//!
//! The manifest is read fully, mutated in memory, and written back fully
//! through an atomic rename. There is no cross-process lock: two concurrent
//! invocations against the same work directory are last-writer-wins.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use plf_common::fs::{read_optional, write_atomic};
use tracing::debug;

use crate::manifest::{ResourceStatus, Run};
use crate::{Result, SetupError};

/// Directory under the work dir holding every state file
pub const STATE_DIR: &str = ".snow-utils";
/// File name of the run manifest
pub const MANIFEST_FILE: &str = "setup-manifest.yaml";

const HEADER: &str = "\
# plf setup manifest
#
# Written by plf after every resource transition. Resource `status` values
# (PENDING or DONE) may be edited by hand; the next `plf resume` honours them.
# Do not reorder resources or change ordinals.
";

/// Load/save contract for the run manifest
pub trait RunStore: Send + Sync {
    /// The stored run, or a fresh all-PENDING run when nothing is stored.
    fn load(&self) -> Result<Run>;

    /// Replace the stored run. Readers never observe a partial write.
    fn save(&self, run: &Run) -> Result<()>;

    /// Whether a run has ever been saved
    fn exists(&self) -> Result<bool>;

    /// Load, set one resource's status, save.
    fn update_resource(&self, ordinal: u8, status: ResourceStatus) -> Result<Run> {
        let mut run = self.load()?;
        if run.set_resource_status(ordinal, status)? {
            self.save(&run)?;
        }
        Ok(run)
    }
}

/// YAML manifest at `<work_dir>/.snow-utils/setup-manifest.yaml`
#[derive(Clone, Debug)]
pub struct FileRunStore {
    path: PathBuf,
}

impl FileRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(STATE_DIR).join(MANIFEST_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunStore for FileRunStore {
    fn load(&self) -> Result<Run> {
        let Some(text) = read_optional(&self.path)? else {
            debug!(path = %self.path.display(), "no manifest yet, starting fresh");
            return Ok(Run::default());
        };

        let run: Run = serde_yaml::from_str(&text)
            .map_err(|e| plf_common::Error::corrupt_state(&self.path, e.to_string()))?;
        run.validate()
            .map_err(|msg| plf_common::Error::corrupt_state(&self.path, msg))?;
        Ok(run)
    }

    fn save(&self, run: &Run) -> Result<()> {
        let mut run = run.clone();
        run.updated_at = Some(Utc::now());
        let body = serde_yaml::to_string(&run)
            .map_err(|e| SetupError::validation(format!("cannot serialize manifest: {e}")))?;
        write_atomic(&self.path, format!("{HEADER}{body}").as_bytes())?;
        debug!(path = %self.path.display(), status = %run.status, "saved manifest");
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }
}

/// In-memory store that keeps every saved version, oldest first.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    current: Mutex<Option<Run>>,
    history: Mutex<Vec<Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `run` (not counted as a save)
    pub fn with_run(run: Run) -> Self {
        Self {
            current: Mutex::new(Some(run)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every run passed to `save`, in order
    pub fn history(&self) -> Vec<Run> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or_default()
    }
}

fn poisoned() -> SetupError {
    SetupError::validation("run store lock poisoned")
}

impl RunStore for MemoryRunStore {
    fn load(&self) -> Result<Run> {
        let current = self.current.lock().map_err(|_| poisoned())?;
        Ok(current.clone().unwrap_or_default())
    }

    fn save(&self, run: &Run) -> Result<()> {
        *self.current.lock().map_err(|_| poisoned())? = Some(run.clone());
        self.history.lock().map_err(|_| poisoned())?.push(run.clone());
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.current.lock().map_err(|_| poisoned())?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RunConfig, RunStatus};

    fn config() -> RunConfig {
        RunConfig {
            container_runtime: Some("docker".into()),
            cluster_name: "polaris-dev".into(),
            project_name: "polaris-dev".into(),
        }
    }

    #[test]
    fn missing_manifest_loads_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());
        assert!(!store.exists().unwrap());
        let run = store.load().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.resources.len(), 7);
    }

    #[test]
    fn save_then_load_preserves_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());

        let mut run = Run::new(config());
        run.mark_done(1).unwrap();
        store.save(&run).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.status, RunStatus::InProgress);
        assert_eq!(loaded.resources, run.resources);
        assert_eq!(loaded.config, run.config);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn on_disk_form_is_readable_yaml_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());
        store.save(&Run::new(config())).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("# plf setup manifest"));
        assert!(text.contains("status: PENDING"));
        assert!(text.contains("label: k3d cluster"));
        assert!(text.contains("kind: catalog-service"));
    }

    #[test]
    fn hand_edited_status_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());
        store.save(&Run::new(config())).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let edited = text.replacen(
            "kind: cluster\n  status: PENDING",
            "kind: cluster\n  status: DONE",
            1,
        );
        std::fs::write(store.path(), edited).unwrap();

        assert!(store.load().unwrap().is_done(1));
    }

    #[test]
    fn malformed_manifest_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "status: [not, a, status\n").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            SetupError::Common(plf_common::Error::CorruptState { .. })
        ));
        assert!(err.to_string().contains(MANIFEST_FILE));
    }

    #[test]
    fn structurally_invalid_manifest_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::in_work_dir(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            "status: PENDING\nresources:\n- ordinal: 1\n  label: k3d cluster\n  kind: cluster\n  status: PENDING\n",
        )
        .unwrap();

        assert!(matches!(
            store.load().unwrap_err(),
            SetupError::Common(plf_common::Error::CorruptState { .. })
        ));
    }

    #[test]
    fn update_resource_persists_immediately() {
        let store = MemoryRunStore::with_run(Run::new(config()));
        let run = store.update_resource(2, ResourceStatus::Done).unwrap();
        assert!(run.is_done(2));
        assert_eq!(store.save_count(), 1);

        store.update_resource(2, ResourceStatus::Done).unwrap();
        assert_eq!(store.save_count(), 1, "no-op update must not write");
    }
}
