//! File-backed store: one directory per environment holding JSON-lines logs.
//!
//! ```text
//! <root>/<environment>/.lock
//! <root>/<environment>/artifacts.jsonl
//! <root>/<environment>/actions.jsonl
//! ```

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

use super::{ActionRecord, Artifact, ArtifactStore, Ledger};
use crate::{DeployError, unit::UnitId};

const LOCK_FILENAME: &str = ".lock";
const ARTIFACTS_FILENAME: &str = "artifacts.jsonl";
const ACTIONS_FILENAME: &str = "actions.jsonl";

/// Open handles for a claimed environment. The lock is held until drop.
struct EnvironmentFiles {
    _lock: File,
    artifacts: File,
    actions: File,
}

/// Durable store surviving process restarts.
pub struct FileStore {
    root: PathBuf,
    ledger: Ledger,
    environments: BTreeMap<String, EnvironmentFiles>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ledger: Ledger::default(),
            environments: BTreeMap::new(),
        }
    }

    /// Create a store rooted at `root` and claim `environment` right away.
    pub fn open(root: impl Into<PathBuf>, environment: &str) -> Result<Self, DeployError> {
        let mut store = Self::new(root);
        store.begin(environment)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn environment_dir(&self, environment: &str) -> PathBuf {
        self.root.join(environment)
    }

    fn files(&mut self, environment: &str) -> Result<&mut EnvironmentFiles, DeployError> {
        self.environments.get_mut(environment).ok_or_else(|| not_opened(environment))
    }

    fn ensure_open(&self, environment: &str) -> Result<(), DeployError> {
        if self.environments.contains_key(environment) {
            Ok(())
        } else {
            Err(not_opened(environment))
        }
    }
}

impl ArtifactStore for FileStore {
    fn begin(&mut self, environment: &str) -> Result<(), DeployError> {
        if self.environments.contains_key(environment) {
            return Ok(());
        }

        let dir = self.environment_dir(environment);
        std::fs::create_dir_all(&dir)
            .map_err(|e| DeployError::io(format!("failed to create {}", dir.display()), e))?;

        let lock_path = dir.join(LOCK_FILENAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| DeployError::io(format!("failed to open {}", lock_path.display()), e))?;

        if lock.try_lock_exclusive().is_err() {
            return Err(DeployError::ConcurrentRun {
                environment: environment.to_string(),
                lock_path,
            });
        }

        let artifacts_path = dir.join(ARTIFACTS_FILENAME);
        let actions_path = dir.join(ACTIONS_FILENAME);

        // Nothing reaches the shared ledger unless the whole environment loads.
        let mut loaded = Ledger::default();
        for artifact in load_records::<Artifact>(&artifacts_path)? {
            loaded.check_artifact(environment, &artifact)?;
            loaded.insert_artifact(artifact);
        }
        for record in load_records::<ActionRecord>(&actions_path)? {
            loaded.check_action(environment, &record)?;
            loaded.insert_action(environment, record);
        }

        let files = EnvironmentFiles {
            _lock: lock,
            artifacts: open_append(&artifacts_path)?,
            actions: open_append(&actions_path)?,
        };

        tracing::debug!(
            environment,
            path = %dir.display(),
            artifacts = loaded.artifacts.len(),
            actions = loaded.actions.len(),
            "Opened artifact store"
        );

        self.ledger.merge(loaded);
        self.environments.insert(environment.to_string(), files);

        Ok(())
    }

    fn get(&self, environment: &str, unit: &UnitId) -> Result<Option<Artifact>, DeployError> {
        self.ensure_open(environment)?;
        Ok(self.ledger.artifact(environment, unit).cloned())
    }

    fn put(&mut self, environment: &str, artifact: Artifact) -> Result<(), DeployError> {
        self.ensure_open(environment)?;
        self.ledger.check_artifact(environment, &artifact)?;

        let path = self.environment_dir(environment).join(ARTIFACTS_FILENAME);
        append_record(&mut self.files(environment)?.artifacts, &artifact, &path)?;
        self.ledger.insert_artifact(artifact);
        Ok(())
    }

    fn action(
        &self,
        environment: &str,
        unit: &UnitId,
        action_key: &str,
    ) -> Result<Option<ActionRecord>, DeployError> {
        self.ensure_open(environment)?;
        Ok(self.ledger.action(environment, unit, action_key).cloned())
    }

    fn record_action(
        &mut self,
        environment: &str,
        record: ActionRecord,
    ) -> Result<(), DeployError> {
        self.ensure_open(environment)?;
        self.ledger.check_action(environment, &record)?;

        let path = self.environment_dir(environment).join(ACTIONS_FILENAME);
        append_record(&mut self.files(environment)?.actions, &record, &path)?;
        self.ledger.insert_action(environment, record);
        Ok(())
    }

    fn artifacts(&self, environment: &str) -> Result<Vec<Artifact>, DeployError> {
        self.ensure_open(environment)?;
        Ok(self.ledger.artifacts_of(environment))
    }

    fn actions(&self, environment: &str) -> Result<Vec<ActionRecord>, DeployError> {
        self.ensure_open(environment)?;
        Ok(self.ledger.actions_of(environment))
    }
}

fn not_opened(environment: &str) -> DeployError {
    DeployError::Script(anyhow::anyhow!(
        "environment `{environment}` was not opened on this store"
    ))
}

fn open_append(path: &Path) -> Result<File, DeployError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DeployError::io(format!("failed to open {}", path.display()), e))
}

/// Append one JSON line and flush it to disk before returning.
fn append_record<T: Serialize>(
    file: &mut File,
    record: &T,
    path: &Path,
) -> Result<(), DeployError> {
    let mut line = serde_json::to_vec(record).map_err(|e| {
        DeployError::io(
            format!("failed to encode record for {}", path.display()),
            e.into(),
        )
    })?;
    line.push(b'\n');

    file.write_all(&line)
        .and_then(|()| file.sync_data())
        .map_err(|e| DeployError::io(format!("failed to append to {}", path.display()), e))
}

/// Read every complete record from a JSON-lines file.
///
/// A trailing line without its newline is the remains of an interrupted write;
/// it is discarded and cut from the file so later appends start on a clean line.
fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, DeployError> {
    let mut content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DeployError::io(format!("failed to read {}", path.display()), e)),
    };

    if !content.is_empty() && !content.ends_with('\n') {
        let keep = content.rfind('\n').map_or(0, |index| index + 1);
        tracing::warn!(
            path = %path.display(),
            discarded_bytes = content.len() - keep,
            "Discarding torn trailing record"
        );

        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(keep as u64))
            .map_err(|e| DeployError::io(format!("failed to truncate {}", path.display()), e))?;
        content.truncate(keep);
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                DeployError::io(
                    format!("corrupt record at {}:{}", path.display(), index + 1),
                    e.into(),
                )
            })
        })
        .collect()
}
