use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use super::document::write_atomic;
use crate::error::AppResult;

/// Machine identifier reported with every control-plane call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub label: Option<String>,
}

impl MachineIdentity {
    /// Resolve the machine id.
    ///
    /// A configured id wins. Otherwise the id stored at `path` is reused, and a
    /// fresh UUID is generated and persisted when none exists yet.
    pub async fn load_or_create(
        configured: Option<&str>,
        label: Option<String>,
        path: &Path,
    ) -> AppResult<Self> {
        if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(Self {
                machine_id: id.to_string(),
                label,
            });
        }

        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let stored = text.trim();
                if !stored.is_empty() {
                    return Ok(Self {
                        machine_id: stored.to_string(),
                        label,
                    });
                }
                warn!(path = %path.display(), "machine id file is empty, generating a new id");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let machine_id = Uuid::new_v4().to_string();
        write_atomic(path, format!("{machine_id}\n").as_bytes()).await?;
        info!(machine_id = %machine_id, path = %path.display(), "generated machine id");

        Ok(Self { machine_id, label })
    }
}
