//! Lock key: the `(repository, project_path, workspace)` partition key.

use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Namespace prefix shared by every persisted lock record.
pub const KEY_PREFIX: &str = "atlantis:enhanced:lock:";

/// Identifies one Terraform project-workspace.
///
/// Equality is exact and case-sensitive on all three components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    repository: String,
    project_path: String,
    workspace: String,
}

impl LockKey {
    /// Build a key, rejecting empty components and control characters.
    pub fn new(
        repository: impl Into<String>,
        project_path: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            repository: repository.into(),
            project_path: project_path.into(),
            workspace: workspace.into(),
        };

        for (name, value) in [
            ("repository", &key.repository),
            ("project path", &key.project_path),
            ("workspace", &key.workspace),
        ] {
            if value.is_empty() {
                return Err(LockError::InvalidKey(format!("{} must not be empty", name)));
            }
            if value.chars().any(char::is_control) {
                return Err(LockError::InvalidKey(format!(
                    "{} '{}' contains control characters",
                    name,
                    value.escape_debug()
                )));
            }
        }

        Ok(key)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The namespaced key used by both backends:
    /// `atlantis:enhanced:lock:<repo>/<project>/<workspace>`.
    pub fn storage_key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self)
    }

    /// Stable file name for the embedded table.
    ///
    /// Repository and project paths may contain separators and exceed file name
    /// limits, so the storage key is hashed.
    pub(crate) fn file_stem(&self) -> String {
        let digest = Sha256::digest(self.storage_key().as_bytes());
        format!("{:x}", digest)
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.repository, self.project_path, self.workspace)
    }
}
