//! Staging-area ownership and the installer handoff.
//!
//! The staging area is a per-host-identity directory holding the downloaded
//! artifact, the extraction tree, and a JSON resume marker that lets an
//! interrupted session re-enter without re-downloading. A lock file keeps
//! two sessions from working the same staging directory at once.
//!
//! The actual install is behind the [`Installer`] trait so hosts can supply
//! their own mechanism; [`ProcessInstaller`] covers the common cases:
//! atomic replace for single binaries, directory copy for bundles, and a
//! detached platform package installer for package artifacts.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::appcast::InstallationKind;
use crate::error::UpdateError;

const LOCK_FILE: &str = ".lock";
const MARKER_FILE: &str = "resume.json";
const ARTIFACT_DIR: &str = "artifact";
const EXTRACTION_DIR: &str = "extracted";

/// A lock file this old was left by a session that never released it.
const LOCK_STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Where an interrupted session got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeStage {
    /// The artifact is fully downloaded and verified by hash.
    Downloaded,
    /// The installer handoff had begun when the session ended.
    Installing,
}

/// Persisted record of an in-flight update, written next to the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeMarker {
    /// Version string of the item the artifact belongs to.
    pub version: String,
    /// How far the previous session got.
    pub stage: ResumeStage,
    /// Staged artifact path.
    pub artifact: PathBuf,
    /// blake3 hash of the staged artifact, hex-encoded.
    pub blake3: String,
}

/// Exclusive handle on the per-host staging directory.
///
/// Holds a pid-stamped lock file for its lifetime; the lock is removed on
/// drop so a clean shutdown releases the directory. A lock left behind by a
/// crashed session is reclaimed on the next claim, keeping the resume
/// marker usable after abrupt termination.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Claims the staging directory, creating it if needed.
    ///
    /// Fails with [`UpdateError::Configuration`] when another live session
    /// holds the lock. A stale lock (its recorded owner is no longer
    /// running, or it has outlived [`LOCK_STALE_AFTER`]) is removed and the
    /// claim retried.
    pub fn claim(root: impl Into<PathBuf>) -> Result<Self, UpdateError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let lock = root.join(LOCK_FILE);
        let mut reclaimed = false;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(Self { root });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !reclaimed && lock_is_stale(&lock) {
                        tracing::warn!(lock = %lock.display(), "reclaiming stale staging lock");
                        match std::fs::remove_file(&lock) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        reclaimed = true;
                        continue;
                    }
                    return Err(UpdateError::Configuration(format!(
                        "staging area {} is locked by another session",
                        root.display()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Directory holding the downloaded artifact.
    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(ARTIFACT_DIR)
    }

    /// Directory the archive is unpacked into.
    pub fn extraction_dir(&self) -> PathBuf {
        self.root.join(EXTRACTION_DIR)
    }

    /// Staged path for an artifact with the given filename.
    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.artifact_dir().join(filename)
    }

    /// Loads the resume marker, if a readable one exists.
    pub fn load_marker(&self) -> Option<ResumeMarker> {
        let bytes = std::fs::read(self.root.join(MARKER_FILE)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable resume marker");
                None
            }
        }
    }

    /// Persists the resume marker atomically.
    pub fn save_marker(&self, marker: &ResumeMarker) -> Result<(), UpdateError> {
        let path = self.root.join(MARKER_FILE);
        let tmp = self.root.join(format!("{MARKER_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(marker).map_err(io::Error::other)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Removes the resume marker, if present.
    pub fn clear_marker(&self) -> Result<(), UpdateError> {
        match std::fs::remove_file(self.root.join(MARKER_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes everything staged, keeping the claim on the directory.
    pub fn clear(&self) -> Result<(), UpdateError> {
        self.clear_marker()?;
        for dir in [self.artifact_dir(), self.extraction_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.root.join(LOCK_FILE));
    }
}

/// Whether a lock file was abandoned by a session that can no longer
/// release it: its recorded owner is not a live process, or it has
/// outlived [`LOCK_STALE_AFTER`].
fn lock_is_stale(lock: &Path) -> bool {
    if let Ok(contents) = std::fs::read_to_string(lock) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            if !pid_is_alive(pid) {
                return true;
            }
        }
    }
    match std::fs::metadata(lock).and_then(|m| m.modified()) {
        Ok(modified) => modified
            .elapsed()
            .map(|age| age > LOCK_STALE_AFTER)
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    // Liveness cannot be checked here; the age bound decides.
    true
}

/// A fully validated update ready to hand to an installer.
#[derive(Debug, Clone)]
pub struct InstallJob {
    /// How the payload should be installed.
    pub kind: InstallationKind,
    /// Validated payload inside the extraction tree (the application file,
    /// bundle directory, or package file).
    pub payload: PathBuf,
    /// Install destination.
    pub target: PathBuf,
    /// Whether installing requires elevated privileges.
    pub needs_authorization: bool,
}

/// Out-of-process installer seam.
///
/// `install` is decoupled from host lifetime: package installs keep running
/// if the host exits afterwards.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Acquires whatever authorization `job` needs. Failure leaves the
    /// staged update intact for a later attempt.
    async fn authorize(&self, _job: &InstallJob) -> Result<(), UpdateError> {
        Ok(())
    }

    /// Performs the install.
    async fn install(&self, job: &InstallJob) -> Result<(), UpdateError>;
}

/// Default installer for unix-like hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInstaller;

impl ProcessInstaller {
    /// Finds the payload for `kind` inside an extraction tree: top-level
    /// entry when obvious, shallow walk otherwise.
    pub fn locate_payload(
        extraction_dir: &Path,
        kind: InstallationKind,
    ) -> Result<PathBuf, UpdateError> {
        let wanted_pkg = matches!(
            kind,
            InstallationKind::GuidedPackage | InstallationKind::InteractivePackage
        );

        for entry in walkdir::WalkDir::new(extraction_dir)
            .min_depth(1)
            .max_depth(3)
            .into_iter()
            .flatten()
        {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let is_pkg = entry
                .path()
                .extension()
                .is_some_and(|e| e == "pkg" || e == "mpkg");
            if wanted_pkg && is_pkg {
                return Ok(entry.path().to_path_buf());
            }
            if !wanted_pkg && !is_pkg {
                let file_type = entry.file_type();
                let is_bundle = file_type.is_dir()
                    && entry.path().extension().is_some_and(|e| e == "app");
                let is_executable = file_type.is_file() && is_executable(entry.path());
                if is_bundle || is_executable {
                    return Ok(entry.path().to_path_buf());
                }
            }
        }

        Err(UpdateError::Installation(format!(
            "no installable payload found in {}",
            extraction_dir.display()
        )))
    }

    /// Whether installing onto `target` requires privileges this process
    /// does not have: the existing target (or its parent directory) is owned
    /// by a different uid than a file we know we own.
    pub fn requires_elevation(target: &Path, owned_probe: &Path) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            let our_uid = match std::fs::metadata(owned_probe) {
                Ok(meta) => meta.uid(),
                Err(_) => return false,
            };
            let probe = if target.exists() {
                target.to_path_buf()
            } else {
                match target.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => return false,
                }
            };
            match std::fs::metadata(&probe) {
                Ok(meta) => meta.uid() != our_uid,
                Err(_) => false,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (target, owned_probe);
            false
        }
    }

    fn install_application(job: &InstallJob) -> Result<(), UpdateError> {
        if job.payload.is_dir() {
            // Bundle directory: stage a sibling copy, then swap.
            let staged = sibling_new(&job.target)?;
            if staged.exists() {
                std::fs::remove_dir_all(&staged)?;
            }
            let options = fs_extra::dir::CopyOptions::new()
                .copy_inside(true)
                .overwrite(true);
            fs_extra::dir::copy(&job.payload, &staged, &options)
                .map_err(|e| UpdateError::Installation(e.to_string()))?;
            if job.target.exists() {
                std::fs::remove_dir_all(&job.target)?;
            }
            std::fs::rename(&staged, &job.target)?;
        } else {
            // Single binary: copy next to the target, then atomic rename.
            let staged = sibling_new(&job.target)?;
            std::fs::copy(&job.payload, &staged)?;
            std::fs::rename(&staged, &job.target)?;
        }
        tracing::info!(target = %job.target.display(), "installed update payload");
        Ok(())
    }

    fn install_package(job: &InstallJob) -> Result<(), UpdateError> {
        let installer = which::which("installer").map_err(|_| {
            UpdateError::Installation("platform package installer not found".into())
        })?;

        // Detached so the package install survives host exit.
        let mut command = Command::new(installer);
        command
            .arg("-pkg")
            .arg(&job.payload)
            .arg("-target")
            .arg("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = command
            .spawn()
            .map_err(|e| UpdateError::Installation(format!("failed to launch installer: {e}")))?;
        tracing::info!(pid = child.id(), payload = %job.payload.display(), "package installer launched");
        Ok(())
    }
}

#[async_trait]
impl Installer for ProcessInstaller {
    async fn authorize(&self, job: &InstallJob) -> Result<(), UpdateError> {
        if job.needs_authorization {
            return Err(UpdateError::Authorization(format!(
                "installing to {} requires elevated privileges",
                job.target.display()
            )));
        }
        Ok(())
    }

    async fn install(&self, job: &InstallJob) -> Result<(), UpdateError> {
        let job = job.clone();
        tokio::task::spawn_blocking(move || match job.kind {
            InstallationKind::Application => Self::install_application(&job),
            InstallationKind::GuidedPackage | InstallationKind::InteractivePackage => {
                Self::install_package(&job)
            }
        })
        .await
        .map_err(|e| UpdateError::Installation(format!("install task panicked: {e}")))?
    }
}

/// Relaunches the installed application, detached from this process.
pub fn relaunch(path: &Path) -> Result<(), UpdateError> {
    let child = Command::new(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| UpdateError::Installation(format!("relaunch failed: {e}")))?;
    tracing::info!(pid = child.id(), path = %path.display(), "relaunched");
    Ok(())
}

fn sibling_new(target: &Path) -> Result<PathBuf, UpdateError> {
    let name = target
        .file_name()
        .ok_or_else(|| UpdateError::Installation("install target has no filename".into()))?;
    let mut staged = name.to_os_string();
    staged.push(".new");
    Ok(target.with_file_name(staged))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("staging");

        let first = StagingArea::claim(&root).unwrap();
        assert!(StagingArea::claim(&root).is_err());
        drop(first);
        StagingArea::claim(&root).unwrap();
    }

    #[test]
    fn test_claim_reclaims_lock_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("staging");
        std::fs::create_dir_all(&root).unwrap();

        // A lock abandoned by a killed session: old enough to exceed the
        // staleness bound no matter what pid it recorded.
        let lock = root.join(LOCK_FILE);
        std::fs::write(&lock, format!("{}\n", std::process::id())).unwrap();
        let old = std::time::SystemTime::now() - (LOCK_STALE_AFTER * 2);
        std::fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let staging = StagingArea::claim(&root).unwrap();
        drop(staging);
        assert!(!lock.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_claim_reclaims_lock_of_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("staging");
        std::fs::create_dir_all(&root).unwrap();

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(root.join(LOCK_FILE), format!("{pid}\n")).unwrap();

        StagingArea::claim(&root).unwrap();
    }

    #[test]
    fn test_marker_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::claim(dir.path().join("staging")).unwrap();
        assert!(staging.load_marker().is_none());

        let marker = ResumeMarker {
            version: "2.0".into(),
            stage: ResumeStage::Downloaded,
            artifact: staging.artifact_path("App-2.0.tar.gz"),
            blake3: "abc123".into(),
        };
        staging.save_marker(&marker).unwrap();

        let loaded = staging.load_marker().unwrap();
        assert_eq!(loaded.version, "2.0");
        assert_eq!(loaded.stage, ResumeStage::Downloaded);

        staging.clear_marker().unwrap();
        assert!(staging.load_marker().is_none());
        staging.clear_marker().unwrap();
    }

    #[test]
    fn test_clear_removes_staged_content() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::claim(dir.path().join("staging")).unwrap();
        std::fs::create_dir_all(staging.artifact_dir()).unwrap();
        std::fs::write(staging.artifact_path("a.tar.gz"), b"x").unwrap();
        staging
            .save_marker(&ResumeMarker {
                version: "2.0".into(),
                stage: ResumeStage::Downloaded,
                artifact: staging.artifact_path("a.tar.gz"),
                blake3: String::new(),
            })
            .unwrap();

        staging.clear().unwrap();
        assert!(!staging.artifact_dir().exists());
        assert!(staging.load_marker().is_none());
    }

    #[test]
    fn test_locate_payload_prefers_executable() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("extracted");
        std::fs::create_dir_all(tree.join("App")).unwrap();
        std::fs::write(tree.join("App/README"), b"readme").unwrap();
        let binary = tree.join("App/app");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let payload =
            ProcessInstaller::locate_payload(&tree, InstallationKind::Application).unwrap();
        assert_eq!(payload, binary);
    }

    #[test]
    fn test_locate_payload_finds_package() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("extracted");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("App-2.0.pkg"), b"pkg").unwrap();

        let payload =
            ProcessInstaller::locate_payload(&tree, InstallationKind::GuidedPackage).unwrap();
        assert!(payload.ends_with("App-2.0.pkg"));
    }

    #[test]
    fn test_locate_payload_empty_tree_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("extracted");
        std::fs::create_dir_all(&tree).unwrap();
        assert!(
            ProcessInstaller::locate_payload(&tree, InstallationKind::Application).is_err()
        );
    }

    #[test]
    fn test_same_owner_does_not_require_elevation() {
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("probe");
        std::fs::write(&probe, b"x").unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"y").unwrap();
        assert!(!ProcessInstaller::requires_elevation(&target, &probe));
    }

    #[tokio::test]
    async fn test_install_application_binary_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("new-binary");
        std::fs::write(&payload, b"v2").unwrap();
        let target = dir.path().join("installed");
        std::fs::write(&target, b"v1").unwrap();

        let job = InstallJob {
            kind: InstallationKind::Application,
            payload,
            target: target.clone(),
            needs_authorization: false,
        };
        ProcessInstaller.authorize(&job).await.unwrap();
        ProcessInstaller.install(&job).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"v2");
        assert!(!dir.path().join("installed.new").exists());
    }

    #[tokio::test]
    async fn test_install_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("Example.app");
        std::fs::create_dir_all(payload.join("Contents")).unwrap();
        std::fs::write(payload.join("Contents/app"), b"v2").unwrap();

        let target = dir.path().join("Installed.app");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old"), b"v1").unwrap();

        let job = InstallJob {
            kind: InstallationKind::Application,
            payload,
            target: target.clone(),
            needs_authorization: false,
        };
        ProcessInstaller.install(&job).await.unwrap();

        assert_eq!(std::fs::read(target.join("Contents/app")).unwrap(), b"v2");
        assert!(!target.join("old").exists());
    }

    #[tokio::test]
    async fn test_authorize_rejects_elevation_jobs() {
        let job = InstallJob {
            kind: InstallationKind::Application,
            payload: PathBuf::from("/tmp/payload"),
            target: PathBuf::from("/usr/local/bin/app"),
            needs_authorization: true,
        };
        assert!(matches!(
            ProcessInstaller.authorize(&job).await,
            Err(UpdateError::Authorization(_))
        ));
    }
}
