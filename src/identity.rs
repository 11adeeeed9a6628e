//! Client identity derivation and persistence.
//!
//! The daemon identifies itself to the remote plane with a stable client
//! id. Two sources exist: the identity provisioned alongside the client
//! certificate (persisted at `<state>/client-id` by enrolment tooling and
//! re-used across restarts), and the host's canonical machine id. An
//! absent client-id file yields an empty id, not an error.

use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::config::{ClientIdSource, Config};
use crate::error::RuntimeError;

const MACHINE_ID_FILE: &str = "/etc/machine-id";

/// Derives the client id per the configured source.
pub fn derive_client_id(cfg: &Config) -> Result<String, RuntimeError> {
    match cfg.client_id_source {
        ClientIdSource::CertCn => from_persisted(&cfg.client_id_file()),
        ClientIdSource::MachineId => from_machine_id(Path::new(MACHINE_ID_FILE)),
    }
}

fn from_persisted(path: &Path) -> Result<String, RuntimeError> {
    if !path.exists() {
        debug!(file = %path.display(), "no persisted client id");
        return Ok(String::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| RuntimeError::Identity {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;
    let id = raw.trim().to_string();
    if !id.is_empty() {
        return Ok(id);
    }
    // Enrolment left an empty file behind; mint and persist a fresh id.
    let id = Uuid::new_v4().to_string();
    persist(path, &id)?;
    Ok(id)
}

fn from_machine_id(path: &Path) -> Result<String, RuntimeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RuntimeError::Identity {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;
    let id = raw.trim().to_string();
    if id.is_empty() {
        return Err(RuntimeError::Identity {
            reason: format!("'{}' is empty", path.display()),
        });
    }
    Ok(id)
}

fn persist(path: &Path, id: &str) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RuntimeError::Identity {
            reason: format!("cannot create '{}': {e}", parent.display()),
        })?;
    }
    std::fs::write(path, id).map_err(|e| RuntimeError::Identity {
        reason: format!("cannot write '{}': {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_yields_an_empty_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = from_persisted(&dir.path().join("client-id")).unwrap();
        assert_eq!(id, "");
    }

    #[test]
    fn persisted_id_is_reused_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-id");
        std::fs::write(&path, "host-1234\n").unwrap();
        assert_eq!(from_persisted(&path).unwrap(), "host-1234");
    }

    #[test]
    fn empty_file_gets_a_fresh_persisted_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-id");
        std::fs::write(&path, "").unwrap();

        let id = from_persisted(&path).unwrap();
        assert!(!id.is_empty());
        // No trailing newline in the persisted file.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), id);
        // Stable across restarts.
        assert_eq!(from_persisted(&path).unwrap(), id);
    }

    #[test]
    fn machine_id_must_exist_and_be_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = from_machine_id(&dir.path().join("machine-id"));
        assert!(missing.is_err());

        let path = dir.path().join("machine-id");
        std::fs::write(&path, "abcdef123456\n").unwrap();
        assert_eq!(from_machine_id(&path).unwrap(), "abcdef123456");
    }
}
