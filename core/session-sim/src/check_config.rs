use std::path::Path;

use serde::Serialize;

use idlesync_core::protocol::{
    normalize_config, SessionConfig, SessionConfigPatch, ValidationIssue,
};

use crate::error::{Result, SimError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    config: SessionConfig,
    issues: Vec<ValidationIssue>,
}

/// Reads a TOML config patch. Keys use the same camelCase names as the
/// persisted JSON, e.g. `idleGraceMs = 60000`.
pub fn load_patch(path: &Path) -> Result<SessionConfigPatch> {
    let raw = fs_err::read_to_string(path)?;
    parse_patch(&raw)
}

fn parse_patch(raw: &str) -> Result<SessionConfigPatch> {
    Ok(toml::from_str(raw)?)
}

pub fn run(path: &Path, strict: bool) -> Result<()> {
    let patch = load_patch(path)?;
    let outcome = normalize_config(&SessionConfig::default(), &patch);
    for issue in &outcome.issues {
        tracing::warn!(field = %issue.field, message = %issue.message, "Config field rejected");
    }
    let rejected = outcome.issues.len();
    let report = Report {
        config: outcome.config,
        issues: outcome.issues,
    };
    let json = serde_json::to_string_pretty(&report).map_err(|source| {
        idlesync_core::SyncError::Json {
            context: "encoding config report".to_string(),
            source,
        }
    })?;
    println!("{}", json);

    if strict && rejected > 0 {
        return Err(SimError::ConfigRejected(rejected));
    }
    Ok(())
}
