//! Reads a state directory written by `FileBackend` and reports every
//! record in its current schema. Legacy shapes are migrated on the way out;
//! records that cannot be read are listed as problems instead of aborting.

use std::path::{Path, PathBuf};

use serde::Serialize;

use idlesync_core::protocol::{
    parse_leader_record, parse_persisted_config, parse_persisted_snapshot, parse_shared_state,
    ErrorInfo, LeaderRecord, PersistedConfig, PersistedSnapshot, SharedSessionState,
};
use idlesync_core::{FileBackend, StorageBackend, StorageKeys, SyncError};

use crate::error::{Result, SimError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectReport {
    pub keys: Vec<String>,
    pub snapshot: Option<PersistedSnapshot>,
    pub config: Option<PersistedConfig>,
    pub shared_state: Option<SharedSessionState>,
    pub leader: Option<LeaderRecord>,
    pub problems: Vec<Problem>,
}

pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("idlesync"))
}

pub fn run(state_dir: Option<PathBuf>, prefix: &str) -> Result<()> {
    let dir = state_dir
        .or_else(default_state_dir)
        .ok_or(SimError::NoStateDir)?;
    tracing::debug!(dir = %dir.display(), prefix = %prefix, "Inspecting state directory");
    let report = inspect(&dir, prefix)?;
    let json = serde_json::to_string_pretty(&report).map_err(|source| SyncError::Json {
        context: "encoding inspect report".to_string(),
        source,
    })?;
    println!("{}", json);
    Ok(())
}

pub fn inspect(dir: &Path, prefix: &str) -> Result<InspectReport> {
    let backend = FileBackend::new(dir);
    let keys = StorageKeys::new(prefix);
    let mut report = InspectReport {
        keys: backend.keys().map_err(SyncError::from)?,
        ..Default::default()
    };

    report.snapshot = read(&backend, &keys.snapshot(), parse_persisted_snapshot, &mut report.problems)?;
    report.config = read(&backend, &keys.config(), parse_persisted_config, &mut report.problems)?;
    report.shared_state = read(&backend, &keys.shared_state(), parse_shared_state, &mut report.problems)?;
    report.leader = read(&backend, &keys.leader(), parse_leader_record, &mut report.problems)?;
    Ok(report)
}

fn read<T>(
    backend: &FileBackend,
    key: &str,
    parse: fn(&str) -> std::result::Result<T, ErrorInfo>,
    problems: &mut Vec<Problem>,
) -> Result<Option<T>> {
    let Some(raw) = backend.read(key).map_err(SyncError::from)? else {
        return Ok(None);
    };
    match parse(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            problems.push(Problem {
                key: key.to_string(),
                code: err.code,
                message: err.message,
            });
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use idlesync_core::protocol::{SessionConfigPatch, SessionState, SyncMode};
    use idlesync_core::{ManualClock, SessionTimeout};
    use tempfile::tempdir;

    #[test]
    fn reports_records_written_by_a_session() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut session = SessionTimeout::builder()
            .clock(clock.clone())
            .backend(Arc::new(FileBackend::new(dir.path())))
            .config(SessionConfigPatch {
                sync_mode: Some(SyncMode::Leader),
                ..Default::default()
            })
            .instance_id("tab-1")
            .build();
        session.start();
        session.set_config(SessionConfigPatch {
            countdown_ms: Some(90_000),
            ..Default::default()
        });

        let report = inspect(dir.path(), "idlesync").unwrap();
        assert!(report.problems.is_empty());
        assert_eq!(
            report.snapshot.map(|s| s.snapshot.state),
            Some(SessionState::Idle)
        );
        assert_eq!(report.config.map(|c| c.config.countdown_ms), Some(90_000));
        assert_eq!(report.leader.map(|l| l.id), Some("tab-1".to_string()));
        let shared = report.shared_state.unwrap();
        assert_eq!(shared.config.revision, 1);
        assert!(report.keys.contains(&"idlesync:shared-state".to_string()));
    }

    #[test]
    fn migrates_legacy_and_lists_broken_records() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        backend
            .write(
                "idlesync:shared-state",
                r#"{"version":1,"updatedAt":42,"snapshot":{"state":"IDLE","remainingMs":1000}}"#,
                "x",
            )
            .unwrap();
        backend.write("idlesync:leader", "not json", "x").unwrap();

        let report = inspect(dir.path(), "idlesync").unwrap();
        let shared = report.shared_state.unwrap();
        assert_eq!(shared.metadata.revision, 0);
        assert_eq!(shared.metadata.logical_clock, 42);
        assert_eq!(shared.metadata.writer_id, "legacy");
        assert!(report.leader.is_none());
        assert_eq!(report.problems.len(), 1);
        assert_eq!(report.problems[0].key, "idlesync:leader");
    }

    #[test]
    fn empty_directory_reports_nothing() {
        let dir = tempdir().unwrap();
        let report = inspect(dir.path(), "idlesync").unwrap();
        assert!(report.keys.is_empty());
        assert!(report.snapshot.is_none());
        assert!(report.problems.is_empty());
    }
}
