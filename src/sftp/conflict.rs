//! Destination conflict resolution
//!
//! A pre-flight check run once per transfer request, before the item is handed
//! to the [`TransferQueue`](super::TransferQueue). The resolver only looks at
//! existence and modification time on each side; it never touches file
//! contents.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::{file_name, numbered_local_path, numbered_remote_path};
use super::remote::RemoteFs;
use super::types::{FileStat, TransferDirection};
use crate::config::TransferSettings;

/// Upper bound on `name (N).ext` candidates probed by [`ConflictPolicy::Rename`]
const MAX_RENAME_CANDIDATES: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Report the conflict and let the caller decide
    #[default]
    Ask,
    Overwrite,
    /// Overwrite only when the source is strictly newer
    OverwriteNewer,
    Skip,
    /// Write to the first free `name (N).ext`
    Rename,
}

/// What the caller shows a human for a [`ConflictPolicy::Ask`] decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictFileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    /// Unix seconds
    pub modified: i64,
}

impl ConflictFileInfo {
    fn new(path: &str, stat: FileStat) -> Self {
        Self {
            path: path.to_string(),
            name: file_name(path),
            size: stat.size,
            modified: stat.modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub source: ConflictFileInfo,
    pub destination: ConflictFileInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ConflictResolution {
    Proceed { destination: String },
    Skip,
    Conflict(ConflictInfo),
}

impl ConflictResolution {
    /// `Some(destination)` to enqueue, `None` to skip.
    ///
    /// An unanswered conflict cannot be enqueued.
    pub fn into_destination(self) -> Result<Option<String>, SftpError> {
        match self {
            Self::Proceed { destination } => Ok(Some(destination)),
            Self::Skip => Ok(None),
            Self::Conflict(info) => Err(SftpError::ConflictUnresolved(info.destination.path)),
        }
    }
}

/// Stateless apart from the remote side it stats against and the policy
/// applied when the caller does not pick one.
pub struct ConflictResolver {
    remote: Arc<dyn RemoteFs>,
    default_policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(remote: Arc<dyn RemoteFs>) -> Self {
        Self {
            remote,
            default_policy: ConflictPolicy::default(),
        }
    }

    /// Resolver whose default policy comes from the persisted transfer settings
    pub fn from_settings(remote: Arc<dyn RemoteFs>, settings: &TransferSettings) -> Self {
        Self {
            remote,
            default_policy: settings.conflict_policy,
        }
    }

    pub fn default_policy(&self) -> ConflictPolicy {
        self.default_policy
    }

    /// [`resolve`](Self::resolve) with the configured default policy.
    pub async fn resolve_default(
        &self,
        direction: TransferDirection,
        source: &str,
        destination: &str,
    ) -> Result<ConflictResolution, SftpError> {
        self.resolve(self.default_policy, direction, source, destination)
            .await
    }

    pub async fn resolve(
        &self,
        policy: ConflictPolicy,
        direction: TransferDirection,
        source: &str,
        destination: &str,
    ) -> Result<ConflictResolution, SftpError> {
        let Some(dest_stat) = self.stat(direction.destination_side(), destination).await? else {
            return Ok(ConflictResolution::Proceed {
                destination: destination.to_string(),
            });
        };
        debug!("Destination exists: {} (policy {:?})", destination, policy);

        match policy {
            ConflictPolicy::Overwrite => Ok(ConflictResolution::Proceed {
                destination: destination.to_string(),
            }),
            ConflictPolicy::Skip => Ok(ConflictResolution::Skip),
            ConflictPolicy::OverwriteNewer => {
                let src_stat = self.require_source(direction, source).await?;
                if src_stat.modified > dest_stat.modified {
                    Ok(ConflictResolution::Proceed {
                        destination: destination.to_string(),
                    })
                } else {
                    Ok(ConflictResolution::Skip)
                }
            }
            ConflictPolicy::Rename => {
                let renamed = self.free_name(direction, destination).await?;
                info!("Renaming destination {} -> {}", destination, renamed);
                Ok(ConflictResolution::Proceed {
                    destination: renamed,
                })
            }
            ConflictPolicy::Ask => {
                let src_stat = self.require_source(direction, source).await?;
                Ok(ConflictResolution::Conflict(ConflictInfo {
                    source: ConflictFileInfo::new(source, src_stat),
                    destination: ConflictFileInfo::new(destination, dest_stat),
                }))
            }
        }
    }

    async fn require_source(
        &self,
        direction: TransferDirection,
        source: &str,
    ) -> Result<FileStat, SftpError> {
        self.stat(direction.source_side(), source)
            .await?
            .ok_or_else(|| SftpError::NotFound(source.to_string()))
    }

    async fn free_name(
        &self,
        direction: TransferDirection,
        destination: &str,
    ) -> Result<String, SftpError> {
        let side = direction.destination_side();
        for n in 1..=MAX_RENAME_CANDIDATES {
            let candidate = match side {
                Side::Local => numbered_local_path(destination, n),
                Side::Remote => numbered_remote_path(destination, n),
            };
            if self.stat(side, &candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(SftpError::TransferError(format!(
            "No free name for {} after {} candidates",
            destination, MAX_RENAME_CANDIDATES
        )))
    }

    async fn stat(&self, side: Side, path: &str) -> Result<Option<FileStat>, SftpError> {
        match side {
            Side::Remote => self.remote.stat(path).await,
            Side::Local => local_stat(path).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Local,
    Remote,
}

impl TransferDirection {
    fn source_side(self) -> Side {
        match self {
            TransferDirection::Upload => Side::Local,
            TransferDirection::Download => Side::Remote,
        }
    }

    fn destination_side(self) -> Side {
        match self {
            TransferDirection::Upload => Side::Remote,
            TransferDirection::Download => Side::Local,
        }
    }
}

pub(crate) async fn local_stat(path: &str) -> Result<Option<FileStat>, SftpError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStat {
            size: meta.len(),
            modified: filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
            accessed: filetime::FileTime::from_last_access_time(&meta).unix_seconds(),
            is_dir: meta.is_dir(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SftpError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::memory::MemoryFs;

    fn resolver(fs: MemoryFs) -> ConflictResolver {
        ConflictResolver::new(Arc::new(fs))
    }

    fn write_local(path: &std::path::Path, mtime: i64) {
        std::fs::write(path, b"local").unwrap();
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[tokio::test]
    async fn test_absent_destination_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        write_local(&src, 100);

        let r = resolver(MemoryFs::new());
        let res = r
            .resolve(
                ConflictPolicy::Ask,
                TransferDirection::Upload,
                src.to_str().unwrap(),
                "/srv/a.txt",
            )
            .await
            .unwrap();
        assert_eq!(
            res,
            ConflictResolution::Proceed {
                destination: "/srv/a.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_rename_picks_first_free_remote_name() {
        let fs = MemoryFs::new();
        fs.put("/srv/file.txt", b"x", 100);
        fs.put("/srv/file (1).txt", b"x", 100);

        let res = resolver(fs)
            .resolve(
                ConflictPolicy::Rename,
                TransferDirection::Upload,
                "/nonexistent/file.txt",
                "/srv/file.txt",
            )
            .await
            .unwrap();
        assert_eq!(res.into_destination().unwrap().as_deref(), Some("/srv/file (2).txt"));
    }

    #[tokio::test]
    async fn test_rename_local_destination() {
        let dir = tempfile::tempdir().unwrap();
        write_local(&dir.path().join("log.txt"), 100);

        let dest = dir.path().join("log.txt");
        let res = resolver(MemoryFs::new())
            .resolve(
                ConflictPolicy::Rename,
                TransferDirection::Download,
                "/srv/log.txt",
                dest.to_str().unwrap(),
            )
            .await
            .unwrap();
        let renamed = res.into_destination().unwrap().unwrap();
        assert!(renamed.ends_with("log (1).txt"), "{}", renamed);
    }

    #[tokio::test]
    async fn test_overwrite_newer_compares_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let src = src.to_str().unwrap();

        let fs = MemoryFs::new();
        fs.put("/srv/a.txt", b"remote", 200);
        let r = resolver(fs);

        for (mtime, expected_skip) in [(100, true), (200, true), (201, false)] {
            write_local(std::path::Path::new(src), mtime);
            let res = r
                .resolve(
                    ConflictPolicy::OverwriteNewer,
                    TransferDirection::Upload,
                    src,
                    "/srv/a.txt",
                )
                .await
                .unwrap();
            assert_eq!(res == ConflictResolution::Skip, expected_skip, "mtime {}", mtime);
        }
    }

    #[tokio::test]
    async fn test_ask_reports_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("report.pdf");
        write_local(&dest, 50);

        let fs = MemoryFs::new();
        fs.put("/srv/report.pdf", b"0123456789", 300);

        let res = resolver(fs)
            .resolve(
                ConflictPolicy::Ask,
                TransferDirection::Download,
                "/srv/report.pdf",
                dest.to_str().unwrap(),
            )
            .await
            .unwrap();
        let ConflictResolution::Conflict(info) = res.clone() else {
            panic!("expected conflict, got {:?}", res);
        };
        assert_eq!(info.source.name, "report.pdf");
        assert_eq!(info.source.size, 10);
        assert_eq!(info.source.modified, 300);
        assert_eq!(info.destination.modified, 50);
        assert!(matches!(
            res.into_destination(),
            Err(SftpError::ConflictUnresolved(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_and_overwrite() {
        let fs = MemoryFs::new();
        fs.put("/srv/a", b"x", 1);
        let r = resolver(fs);

        let skip = r
            .resolve(ConflictPolicy::Skip, TransferDirection::Upload, "/l/a", "/srv/a")
            .await
            .unwrap();
        assert_eq!(skip.into_destination().unwrap(), None);

        let over = r
            .resolve(ConflictPolicy::Overwrite, TransferDirection::Upload, "/l/a", "/srv/a")
            .await
            .unwrap();
        assert_eq!(over.into_destination().unwrap().as_deref(), Some("/srv/a"));
    }

    #[tokio::test]
    async fn test_default_policy_comes_from_settings() {
        let fs = MemoryFs::new();
        fs.put("/srv/app.log", b"x", 1);
        let fs: Arc<dyn RemoteFs> = Arc::new(fs);

        assert_eq!(ConflictResolver::new(fs.clone()).default_policy(), ConflictPolicy::Ask);

        let settings = TransferSettings {
            conflict_policy: ConflictPolicy::Rename,
            ..TransferSettings::default()
        };
        let r = ConflictResolver::from_settings(fs, &settings);
        assert_eq!(r.default_policy(), ConflictPolicy::Rename);

        let res = r
            .resolve_default(TransferDirection::Upload, "/l/app.log", "/srv/app.log")
            .await
            .unwrap();
        assert_eq!(
            res.into_destination().unwrap().as_deref(),
            Some("/srv/app (1).log")
        );
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(
            serde_json::to_string(&ConflictPolicy::OverwriteNewer).unwrap(),
            "\"overwrite-newer\""
        );
        let p: ConflictPolicy = serde_json::from_str("\"rename\"").unwrap();
        assert_eq!(p, ConflictPolicy::Rename);
    }
}
