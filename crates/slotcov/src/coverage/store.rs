//! Registry and data-point persistence
//!
//! Registries change far less often than counters, so each version is
//! stored once as `<project>-<version>.screg` and referenced by any number
//! of data points through their registry version.

use super::codec::{self, FrameHeader};
use super::data_point::DATA_POINT_EXTENSION;
use super::Registry;
use crate::result::{CoverageError, CoverageResult};
use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File type tag for stored registries
pub const REGISTRY_MAGIC: [u8; 4] = *b"SCRG";

/// Registry file layout version
pub const REGISTRY_FORMAT_VERSION: u16 = 1;

const SUPPORTED: RangeInclusive<u16> = 1..=1;

/// File extension for stored registries
pub const REGISTRY_EXTENSION: &str = "screg";

/// Source of historical registry versions
pub trait RegistryHistory {
    /// Registry `version` of `project`, if available
    fn registry(&self, project: &str, version: u64) -> Option<Registry>;
}

/// Registry versions held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    versions: BTreeMap<(String, u64), Registry>,
}

impl InMemoryHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a registry version
    pub fn insert(&mut self, registry: Registry) {
        let _ = self
            .versions
            .insert((registry.project().to_string(), registry.version()), registry);
    }

    /// Builder form of [`InMemoryHistory::insert`]
    #[must_use]
    pub fn with(mut self, registry: Registry) -> Self {
        self.insert(registry);
        self
    }
}

impl RegistryHistory for InMemoryHistory {
    fn registry(&self, project: &str, version: u64) -> Option<Registry> {
        self.versions.get(&(project.to_string(), version)).cloned()
    }
}

/// Directory of stored registry versions
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    /// Open (and create if needed) a registry directory
    ///
    /// # Errors
    ///
    /// If the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> CoverageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the registry files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one stored version
    #[must_use]
    pub fn path_for(&self, project: &str, version: u64) -> PathBuf {
        self.dir.join(format!("{project}-{version}.{REGISTRY_EXTENSION}"))
    }

    /// Persist a registry version, replacing any file of the same version
    ///
    /// The file is written under a unique temp name and renamed into place,
    /// so readers never see a partial file.
    ///
    /// # Errors
    ///
    /// Serialization or I/O failure.
    pub fn save(&self, registry: &Registry) -> CoverageResult<PathBuf> {
        let payload = bincode::serialize(registry).map_err(|e| CoverageError::CorruptedRegistry {
            source_name: registry.project().to_string(),
            reason: format!("serialize: {e}"),
        })?;
        let framed = codec::seal(
            &FrameHeader {
                magic: REGISTRY_MAGIC,
                format_version: REGISTRY_FORMAT_VERSION,
                flags: 0,
                registry_version: registry.version(),
                generation_ts_ms: chrono::Utc::now().timestamp_millis(),
            },
            &payload,
        );
        let path = self.path_for(registry.project(), registry.version());
        // Unique per call; concurrent saves of one version each rename a
        // complete file into place
        let tmp = path.with_extension(format!("{REGISTRY_EXTENSION}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, framed)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(project = %registry.project(), version = registry.version(),
            path = %path.display(), "registry saved");
        Ok(path)
    }

    /// Load one stored version
    ///
    /// # Errors
    ///
    /// I/O failure, `UnsupportedFormat`, or `CorruptedRegistry` if the file
    /// does not validate or describes a different project or version.
    pub fn load(&self, project: &str, version: u64) -> CoverageResult<Registry> {
        let path = self.path_for(project, version);
        let source = path.display().to_string();
        let bytes = fs::read(&path)?;
        let (header, body) = codec::open(&bytes, &source, REGISTRY_MAGIC, SUPPORTED, |s, r| {
            CoverageError::CorruptedRegistry {
                source_name: s.to_string(),
                reason: r,
            }
        })?;
        let registry: Registry =
            bincode::deserialize(body).map_err(|e| CoverageError::CorruptedRegistry {
                source_name: source.clone(),
                reason: format!("deserialize: {e}"),
            })?;
        if registry.project() != project
            || registry.version() != version
            || header.registry_version != version
        {
            return Err(CoverageError::CorruptedRegistry {
                source_name: source,
                reason: format!(
                    "file holds {}@{} but was stored as {project}@{version}",
                    registry.project(),
                    registry.version()
                ),
            });
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Stored versions of `project`, ascending
    ///
    /// # Errors
    ///
    /// If the directory cannot be listed.
    pub fn versions(&self, project: &str) -> CoverageResult<Vec<u64>> {
        let prefix = format!("{project}-");
        let mut versions: Vec<u64> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .filter_map(|e| {
                let path = e.path();
                if path.extension()? != REGISTRY_EXTENSION {
                    return None;
                }
                path.file_stem()?
                    .to_str()?
                    .strip_prefix(&prefix)?
                    .parse()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Most recent stored version of `project`
    ///
    /// # Errors
    ///
    /// Listing or loading failure.
    pub fn latest(&self, project: &str) -> CoverageResult<Option<Registry>> {
        match self.versions(project)?.last() {
            Some(&version) => self.load(project, version).map(Some),
            None => Ok(None),
        }
    }
}

impl RegistryHistory for RegistryStore {
    fn registry(&self, project: &str, version: u64) -> Option<Registry> {
        match self.load(project, version) {
            Ok(registry) => Some(registry),
            Err(err) => {
                warn!(project, version, error = %err, "stored registry unavailable");
                None
            }
        }
    }
}

/// Directory of data point files
#[derive(Debug, Clone)]
pub struct DataPointDir {
    dir: PathBuf,
}

impl DataPointDir {
    /// Open (and create if needed) a data point directory
    ///
    /// # Errors
    ///
    /// If the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> CoverageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory path
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every data point file, sorted by name
    ///
    /// # Errors
    ///
    /// If the directory cannot be listed.
    pub fn list(&self) -> CoverageResult<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == DATA_POINT_EXTENSION))
            .collect();
        paths.sort();
        Ok(paths)
    }
}
