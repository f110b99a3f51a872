//! Migration state persistence

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use plf_common::fs::{read_optional, write_atomic};
use plf_setup::store::STATE_DIR;
use tracing::debug;

use crate::state::{MigrationEntity, MigrationState};
use crate::{MigrateError, Result};

/// File name of the migration state
pub const STATE_FILE: &str = "l2c-state.json";

/// Load/save contract for the migration state
pub trait MigrationStore: Send + Sync {
    /// Stored state, or an empty state when nothing is stored.
    fn load(&self) -> Result<MigrationState>;

    /// Replace the stored state. Readers never observe a partial write.
    fn save(&self, state: &MigrationState) -> Result<()>;

    /// Load, apply `update` to one entity, save.
    fn update_entity(
        &self,
        key: &str,
        update: &mut dyn FnMut(&mut MigrationEntity),
    ) -> Result<MigrationState> {
        let mut state = self.load()?;
        let entity = state
            .tables
            .get_mut(key)
            .ok_or_else(|| MigrateError::validation(format!("no table record {}", key)))?;
        update(entity);
        self.save(&state)?;
        Ok(state)
    }
}

/// Pretty JSON at `<work_dir>/.snow-utils/l2c-state.json`
#[derive(Clone, Debug)]
pub struct FileMigrationStore {
    path: PathBuf,
}

impl FileMigrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_work_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(STATE_DIR).join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MigrationStore for FileMigrationStore {
    fn load(&self) -> Result<MigrationState> {
        let Some(text) = read_optional(&self.path)? else {
            return Ok(MigrationState::default());
        };
        let state: MigrationState = serde_json::from_str(&text)
            .map_err(|e| plf_common::Error::corrupt_state(&self.path, e.to_string()))?;
        state
            .validate()
            .map_err(|msg| plf_common::Error::corrupt_state(&self.path, msg))?;
        Ok(state)
    }

    fn save(&self, state: &MigrationState) -> Result<()> {
        let mut body = serde_json::to_string_pretty(state)
            .map_err(|e| MigrateError::validation(format!("cannot serialize state: {e}")))?;
        body.push('\n');
        write_atomic(&self.path, body.as_bytes())?;
        debug!(path = %self.path.display(), tables = state.tables.len(), "saved migration state");
        Ok(())
    }
}

/// In-memory store that keeps every saved version, oldest first.
#[derive(Debug, Default)]
pub struct MemoryMigrationStore {
    current: Mutex<MigrationState>,
    history: Mutex<Vec<MigrationState>>,
}

impl MemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MigrationState) -> Self {
        Self {
            current: Mutex::new(state),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn history(&self) -> Vec<MigrationState> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or_default()
    }
}

fn poisoned() -> MigrateError {
    MigrateError::validation("migration store lock poisoned")
}

impl MigrationStore for MemoryMigrationStore {
    fn load(&self) -> Result<MigrationState> {
        Ok(self.current.lock().map_err(|_| poisoned())?.clone())
    }

    fn save(&self, state: &MigrationState) -> Result<()> {
        *self.current.lock().map_err(|_| poisoned())? = state.clone();
        self.history.lock().map_err(|_| poisoned())?.push(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{entity_key, SyncStatus};
    use plf_setup::TableIdent;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMigrationStore::in_work_dir(dir.path());
        assert_eq!(store.load().unwrap(), MigrationState::default());
    }

    #[test]
    fn state_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMigrationStore::in_work_dir(dir.path());
        let mut state = MigrationState::default();
        state.entity_mut(&TableIdent::new("wildlife", "penguins")).unwrap().sync.status = SyncStatus::Failed;
        store.save(&state).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"WILDLIFE_PENGUINS\""));
        assert!(text.contains("\"status\": \"failed\""));
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn malformed_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMigrationStore::in_work_dir(dir.path());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{\"tables\": [").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Common(plf_common::Error::CorruptState { .. })
        ));
    }

    #[test]
    fn update_entity_touches_one_record() {
        let store = MemoryMigrationStore::new();
        let mut state = MigrationState::default();
        state.entity_mut(&TableIdent::new("wildlife", "penguins")).unwrap();
        state.entity_mut(&TableIdent::new("wildlife", "seals")).unwrap();
        store.save(&state).unwrap();

        let key = entity_key("wildlife", "seals");
        let updated = store
            .update_entity(&key, &mut |e| e.sync.status = SyncStatus::Synced)
            .unwrap();
        assert_eq!(updated.tables[&key].sync.status, SyncStatus::Synced);
        assert_eq!(
            updated.tables["WILDLIFE_PENGUINS"].sync.status,
            SyncStatus::Pending
        );
        assert!(store.update_entity("NOPE", &mut |_| {}).is_err());
    }
}
