//! Checks that must pass before any stage starts.
//!
//! Everything that can only fail because of deployment mistakes (missing
//! credentials, unwritable storage roots) is checked here and reported as
//! [`PipelineError::FatalConfiguration`]. This is also the only place the
//! process environment is read; the result is an immutable [`Credentials`]
//! value handed to the components that need it.

use std::path::Path;

use tracing::debug;

use crate::config::Config;
use crate::error::PipelineError;

/// Secrets resolved from the environment at startup.
#[derive(Clone, Default)]
pub struct Credentials {
    pub source_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("source_token", &self.source_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validate the runtime environment for `config`.
///
/// Source credentials are only required when the run will harvest.
pub fn check(config: &Config, harvesting: bool) -> Result<Credentials, PipelineError> {
    let source_token = if harvesting && config.source.is_enabled() {
        let token = std::env::var(&config.source.token_env).map_err(|_| {
            PipelineError::FatalConfiguration(format!(
                "{} environment variable not set",
                config.source.token_env
            ))
        })?;
        if token.trim().is_empty() {
            return Err(PipelineError::FatalConfiguration(format!(
                "{} environment variable is empty",
                config.source.token_env
            )));
        }
        Some(token)
    } else {
        None
    };

    ensure_dir(&config.storage.raw_data_path, "storage.raw_data_path")?;
    ensure_dir(&config.storage.image_path, "storage.image_path")?;
    if let Some(parent) = config.db.path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent, "db.path parent")?;
        }
    }

    if let Some(transform) = &config.transform {
        if let Some(workdir) = &transform.workdir {
            if !workdir.is_dir() {
                return Err(PipelineError::FatalConfiguration(format!(
                    "transform.workdir does not exist: {}",
                    workdir.display()
                )));
            }
        }
    }

    Ok(Credentials { source_token })
}

fn ensure_dir(path: &Path, field: &str) -> Result<(), PipelineError> {
    std::fs::create_dir_all(path).map_err(|e| {
        PipelineError::FatalConfiguration(format!(
            "{} is not usable ({}): {}",
            field,
            path.display(),
            e
        ))
    })?;
    if !path.is_dir() {
        return Err(PipelineError::FatalConfiguration(format!(
            "{} is not a directory: {}",
            field,
            path.display()
        )));
    }
    debug!(path = %path.display(), field, "storage root ready");
    Ok(())
}
