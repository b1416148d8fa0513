use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use semver::Version;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::exec::TargetRunner;
use crate::feed::{Fetch, FeedError, ReleaseFeed, ReleaseInfo};

/// Where the installed artifact's version comes from.
pub trait VersionProbe {
    /// Version of the artifact at `artifact`; `None` when unknown or absent.
    fn installed_version(&self, artifact: &Path) -> Option<String>;
    /// Remember that `artifact` now holds `version`.
    fn record_version(&self, artifact: &Path, version: &str) -> io::Result<()>;
}

/// Reads the version from a `<artifact>.version` marker written on every
/// successful update. The marker is ignored when the artifact itself is gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerProbe;

impl VersionProbe for MarkerProbe {
    fn installed_version(&self, artifact: &Path) -> Option<String> {
        if !artifact.is_file() {
            return None;
        }
        let version = fs::read_to_string(version_marker_path(artifact)).ok()?;
        let version = version.trim();
        (!version.is_empty()).then(|| version.to_string())
    }

    fn record_version(&self, artifact: &Path, version: &str) -> io::Result<()> {
        fs::write(version_marker_path(artifact), version)
    }
}

/// Asks the artifact itself (`<artifact> --version`) and falls back to the
/// marker when it does not answer with a recognisable version. Recording
/// always goes to the marker.
pub struct ArtifactProbe<'a> {
    runner: &'a dyn TargetRunner,
}

impl<'a> ArtifactProbe<'a> {
    pub fn new(runner: &'a dyn TargetRunner) -> Self {
        Self { runner }
    }
}

impl VersionProbe for ArtifactProbe<'_> {
    fn installed_version(&self, artifact: &Path) -> Option<String> {
        if !artifact.is_file() {
            return None;
        }
        self.runner
            .query_version(artifact)
            .as_deref()
            .and_then(version_from_output)
            .or_else(|| MarkerProbe.installed_version(artifact))
    }

    fn record_version(&self, artifact: &Path, version: &str) -> io::Result<()> {
        MarkerProbe.record_version(artifact, version)
    }
}

/// Pull a semantic version out of `--version` output such as
/// `packwiz-installer 1.2.3` or `v1.2.3`.
pub fn version_from_output(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let word = line.split_whitespace().last()?;
    Version::parse(word.trim_start_matches('v')).ok()?;
    Some(word.to_string())
}

pub fn version_marker_path(artifact: &Path) -> PathBuf {
    sibling(artifact, "version")
}

/// `path` with `.suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// True if `installed` and `tag` name the same release. A leading `v` is ignored
/// and semantic versions compare by value; anything else must match exactly.
pub fn versions_match(installed: &str, tag: &str) -> bool {
    let installed = installed.trim().trim_start_matches('v');
    let tag = tag.trim().trim_start_matches('v');
    match (Version::parse(installed), Version::parse(tag)) {
        (Ok(a), Ok(b)) => a == b,
        _ => installed == tag,
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("could not back up {}", path.display())]
    Backup {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("download of {tag} failed, previous artifact restored")]
    Download {
        tag:    String,
        #[source]
        source: io::Error,
    },
    #[error("download of {tag} failed ({download}) and {} could not be restored", path.display())]
    RollbackFailed {
        tag:      String,
        path:     PathBuf,
        download: io::Error,
        #[source]
        restore:  io::Error,
    },
}

impl UpdateError {
    /// Only a failed restore can leave the artifact missing or corrupted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Feed(FeedError::Unreachable { .. }) => "FeedUnreachable",
            Self::Feed(FeedError::Format(_)) => "FeedFormatError",
            Self::Backup { .. } | Self::Download { .. } | Self::RollbackFailed { .. } => {
                "UpdateIOFailure"
            }
        }
    }
}

#[derive(Debug)]
pub enum UpdateOutcome {
    AlreadyCurrent,
    Updated { tag: String },
    Cancelled,
    Failed(UpdateError),
}

/// Backup guard for the artifact: holds a copy of the original until the
/// replacement is committed. Dropping an uncommitted record restores the copy.
#[derive(Debug)]
pub struct BackupRecord {
    original_path: PathBuf,
    backup_path:   PathBuf,
    has_backup:    bool, // false when there was no artifact to back up
    committed:     bool,
}

impl BackupRecord {
    pub fn backup_path_for(original: &Path) -> PathBuf {
        sibling(original, "bak")
    }

    /// Copy the current artifact aside. Must run before any mutation of `original`.
    pub fn acquire(original: &Path) -> io::Result<Self> {
        let backup_path = Self::backup_path_for(original);
        recover_stale_backup(original, &backup_path)?;

        let has_backup = match fs::copy(original, &backup_path) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        Ok(Self {
            original_path: original.to_path_buf(),
            backup_path,
            has_backup,
            committed: false,
        })
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// The replacement is in place: drop the backup.
    pub fn commit(mut self) -> io::Result<()> {
        self.committed = true;
        if self.has_backup {
            fs::remove_file(&self.backup_path)?;
        }
        Ok(())
    }

    /// Put the original artifact back.
    pub fn rollback(mut self) -> io::Result<()> {
        self.committed = true;
        self.restore()
    }

    fn restore(&self) -> io::Result<()> {
        if self.has_backup {
            fs::rename(&self.backup_path, &self.original_path)?;
        }
        Ok(())
    }
}

impl Drop for BackupRecord {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.restore() {
            warn!(
                backup = %self.backup_path.display(),
                error = %e,
                "could not restore artifact from backup"
            );
        }
    }
}

/// Deal with a backup left behind by an interrupted run. The artifact is only
/// ever replaced by rename, so whatever sits at `original` is complete.
fn recover_stale_backup(original: &Path, backup: &Path) -> io::Result<()> {
    if !backup.exists() {
        return Ok(());
    }
    if original.exists() {
        warn!(backup = %backup.display(), "discarding stale backup");
        fs::remove_file(backup)
    } else {
        warn!(backup = %backup.display(), "artifact missing, restoring stale backup");
        fs::rename(backup, original)
    }
}

/// Keeps the target artifact in step with the release feed.
pub struct AtomicUpdater<'a> {
    feed: &'a dyn ReleaseFeed,
}

impl<'a> AtomicUpdater<'a> {
    pub fn new(feed: &'a dyn ReleaseFeed) -> Self {
        Self { feed }
    }

    /// Check the feed and replace the artifact if it is out of date.
    ///
    /// Whatever the outcome, `config.target_path` afterwards holds either the
    /// previous artifact or the complete new one.
    pub fn ensure_up_to_date(&self, config: &LaunchConfig, probe: &dyn VersionProbe) -> UpdateOutcome {
        let target = &config.target_path;
        let installed = probe.installed_version(target);

        let release = match self
            .feed
            .fetch_latest(&config.update_url, config.access_token.as_deref())
        {
            Ok(Fetch::Ready(release)) => release,
            Ok(Fetch::Cancelled) => return UpdateOutcome::Cancelled,
            Err(e) => return UpdateOutcome::Failed(e.into()),
        };

        info!(
            current = installed.as_deref().unwrap_or("unknown"),
            latest = %release.tag,
            "checked for packwiz-installer updates"
        );
        if installed
            .as_deref()
            .is_some_and(|version| versions_match(version, &release.tag))
        {
            info!("already up to date");
            return UpdateOutcome::AlreadyCurrent;
        }

        info!("attempting to update...");
        let backup = match BackupRecord::acquire(target) {
            Ok(backup) => backup,
            Err(source) => {
                return UpdateOutcome::Failed(UpdateError::Backup {
                    path: target.clone(),
                    source,
                })
            }
        };
        debug!(backup = %backup.backup_path().display(), "current artifact backed up");

        match self.stage(target, &release, config.access_token.as_deref()) {
            Ok(Fetch::Ready(bytes)) => {
                if let Err(e) = probe.record_version(target, &release.tag) {
                    warn!(error = %e, "could not record installed version");
                }
                if let Err(e) = backup.commit() {
                    warn!(error = %e, "could not remove backup");
                }
                info!(tag = %release.tag, bytes, "update successful");
                UpdateOutcome::Updated { tag: release.tag }
            }
            Ok(Fetch::Cancelled) => {
                if let Err(e) = backup.rollback() {
                    warn!(error = %e, "could not restore artifact after cancellation");
                }
                info!("update cancelled");
                UpdateOutcome::Cancelled
            }
            Err(download) => match backup.rollback() {
                Ok(()) => UpdateOutcome::Failed(UpdateError::Download {
                    tag:    release.tag,
                    source: download,
                }),
                Err(restore) => UpdateOutcome::Failed(UpdateError::RollbackFailed {
                    tag: release.tag,
                    path: target.clone(),
                    download,
                    restore,
                }),
            },
        }
    }

    /// Download into a temporary file next to `target`, then rename it over
    /// `target`. A cancelled or failed download leaves `target` untouched.
    fn stage(&self, target: &Path, release: &ReleaseInfo, token: Option<&str>) -> io::Result<Fetch<u64>> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".packwiz-installer")
            .suffix(".part")
            .tempfile_in(dir)?;

        let bytes = match self.feed.download(release, token, staged.as_file_mut())? {
            Fetch::Ready(bytes) => bytes,
            Fetch::Cancelled => return Ok(Fetch::Cancelled),
        };

        staged.as_file().sync_all()?;
        make_executable(staged.path())?;
        staged.persist(target).map_err(|e| e.error)?;
        Ok(Fetch::Ready(bytes))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
