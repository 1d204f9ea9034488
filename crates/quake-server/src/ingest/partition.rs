//! Partition planning
//!
//! Each matching file under `<input root>/<data directory>` becomes one
//! partition. File names are sorted first so partition ids are stable for a
//! given directory listing.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("data directory '{0}' must be a relative path without '..' segments")]
    InvalidDirectory(String),

    #[error("cannot list input directory '{}': {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// "partition{ordinal}"
    pub id: String,
    pub ordinal: usize,
    /// Absolute path of the source file
    pub source_path: PathBuf,
}

impl Partition {
    pub fn new(ordinal: usize, source_path: PathBuf) -> Self {
        Self {
            id: format!("partition{}", ordinal),
            ordinal,
            source_path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub directory: PathBuf,
    pub partitions: Vec<Partition>,
}

impl PartitionPlan {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Reject absolute paths and parent-directory segments
pub fn validate_data_directory(data_directory: &str) -> Result<(), PlanningError> {
    let path = Path::new(data_directory);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

    if escapes {
        return Err(PlanningError::InvalidDirectory(data_directory.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PartitionPlanner {
    input_root: PathBuf,
    file_prefix: String,
    file_suffix: String,
}

impl PartitionPlanner {
    pub fn new(input_root: impl Into<PathBuf>, file_prefix: impl Into<String>, file_suffix: impl Into<String>) -> Self {
        Self {
            input_root: input_root.into(),
            file_prefix: file_prefix.into(),
            file_suffix: file_suffix.into(),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.input_directory.clone(),
            config.file_prefix.clone(),
            config.file_suffix.clone(),
        )
    }

    fn matches(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.file_prefix) && file_name.ends_with(&self.file_suffix)
    }

    /// List the partitions for one job's data directory
    ///
    /// A directory that does not exist yields an empty plan.
    pub async fn plan(&self, data_directory: &str) -> Result<PartitionPlan, PlanningError> {
        validate_data_directory(data_directory)?;
        let directory = self.input_root.join(data_directory);
        let unreadable = |source| PlanningError::Unreadable {
            path: directory.clone(),
            source,
        };

        match tokio::fs::metadata(&directory).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(unreadable(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "not a directory",
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(directory = %directory.display(), "Input directory does not exist, no partitions planned");
                return Ok(PartitionPlan {
                    directory: directory.clone(),
                    partitions: Vec::new(),
                });
            }
            Err(e) => return Err(unreadable(e)),
        }

        let absolute = tokio::fs::canonicalize(&directory).await.map_err(unreadable)?;
        let mut entries = tokio::fs::read_dir(&absolute).await.map_err(unreadable)?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };
            if !self.matches(&name) {
                continue;
            }
            // Follows symlinks so a linked file still counts
            match tokio::fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => names.push(name),
                Ok(_) => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry"),
            }
        }

        names.sort();
        let partitions: Vec<Partition> = names
            .into_iter()
            .enumerate()
            .map(|(ordinal, name)| Partition::new(ordinal, absolute.join(name)))
            .collect();

        info!(
            directory = %absolute.display(),
            partitions = partitions.len(),
            "Planned partitions"
        );

        Ok(PartitionPlan {
            directory: absolute,
            partitions,
        })
    }
}
