//! rclone transport using the system `rclone` binary
//!
//! Uses the user's existing rclone remotes, so credentials never pass
//! through savesync.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use savesync_core::record::RecordSet;
use savesync_core::remote::{Direction, RemoteTransport, TransportError, remote_join};
use savesync_core::store::RECORDS_FILE;
use tokio::process::Command;
use tracing::debug;

/// rclone exit code for "directory not found"
const EXIT_DIR_NOT_FOUND: i32 = 3;
/// rclone exit code for "file not found"
const EXIT_FILE_NOT_FOUND: i32 = 4;

/// Transport backed by `rclone` subcommands
#[derive(Debug, Clone)]
pub struct RcloneTransport {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl RcloneTransport {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args,
        }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(subcommand)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion; a non-zero exit becomes an error
    async fn run(&self, subcommand: &str, args: &[&str]) -> Result<Output, TransportError> {
        debug!(binary = %self.binary.display(), subcommand, ?args, "running rclone");
        let output = self
            .command(subcommand)
            .args(args)
            .output()
            .await
            .map_err(TransportError::Spawn)?;

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let status = output.status.code();
        let target = args.first().copied().unwrap_or_default();
        if is_not_found(status, &stderr) {
            return Err(TransportError::NotFound(target.to_string()));
        }
        Err(TransportError::CommandFailed {
            command: format!("rclone {subcommand} {target}"),
            status,
            stderr,
        })
    }
}

/// Whether a failed rclone call means the remote object does not exist
fn is_not_found(status: Option<i32>, stderr: &str) -> bool {
    matches!(status, Some(EXIT_DIR_NOT_FOUND | EXIT_FILE_NOT_FOUND))
        || stderr.contains("directory not found")
        || stderr.contains("object not found")
}

fn path_arg(path: &Path) -> Result<&str, TransportError> {
    path.to_str().ok_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("non UTF-8 path: {}", path.display()),
        ))
    })
}

#[async_trait]
impl RemoteTransport for RcloneTransport {
    async fn fetch_record_set(
        &self,
        remote_dir: &str,
    ) -> Result<Option<RecordSet>, TransportError> {
        let remote = remote_join(remote_dir, RECORDS_FILE);
        let output = match self.run("cat", &[remote.as_str()]).await {
            Ok(output) => output,
            Err(TransportError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        RecordSet::from_json(&output.stdout)
            .map(Some)
            .map_err(|e| TransportError::Decode(format!("{remote}: {e}")))
    }

    async fn put_record_set(
        &self,
        remote_dir: &str,
        records: &RecordSet,
    ) -> Result<(), TransportError> {
        let bytes = records
            .to_json()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(&bytes)?;
        temp.flush()?;

        let remote = remote_join(remote_dir, RECORDS_FILE);
        self.run("copyto", &[path_arg(temp.path())?, remote.as_str()])
            .await?;
        Ok(())
    }

    async fn transfer(
        &self,
        local: &Path,
        remote: &str,
        direction: Direction,
    ) -> Result<(), TransportError> {
        let local = path_arg(local)?;
        let args = match direction {
            Direction::Upload => [local, remote],
            Direction::Download => [remote, local],
        };
        self.run("copyto", &args).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.run("copyto", &[from, to]).await?;
        Ok(())
    }

    async fn purge(&self, remote_dir: &str) -> Result<(), TransportError> {
        match self.run("purge", &[remote_dir]).await {
            Ok(_) | Err(TransportError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(Some(3), ""));
        assert!(is_not_found(Some(4), ""));
        assert!(is_not_found(
            Some(1),
            "ERROR : saves/records.json: error reading source root directory: directory not found"
        ));
        assert!(!is_not_found(Some(1), "Failed to create file system: didn't find section"));
        assert!(!is_not_found(None, ""));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let transport = RcloneTransport::new("/nonexistent/savesync-rclone", Vec::new());
        let err = transport.fetch_record_set("remote:saves").await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
    }

    #[cfg(unix)]
    mod fake_binary {
        use super::*;
        use std::os::unix::fs::PermissionsExt as _;

        use tempfile::TempDir;

        /// Write a shell script standing in for rclone
        fn fake_rclone(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("rclone");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_fetch_parses_stdout() {
            let dir = TempDir::new().unwrap();
            let json = String::from_utf8(RecordSet::new().to_json().unwrap()).unwrap();
            let script = format!("cat <<'EOF'\n{json}\nEOF");
            let transport = RcloneTransport::new(fake_rclone(&dir, &script), Vec::new());

            let fetched = transport.fetch_record_set("remote:saves").await.unwrap();
            assert_eq!(fetched, Some(RecordSet::new()));
        }

        #[tokio::test]
        async fn test_fetch_exit_three_is_none() {
            let dir = TempDir::new().unwrap();
            let transport = RcloneTransport::new(fake_rclone(&dir, "exit 3"), Vec::new());
            assert_eq!(transport.fetch_record_set("remote:saves").await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_fetch_garbage_is_decode_error() {
            let dir = TempDir::new().unwrap();
            let transport = RcloneTransport::new(fake_rclone(&dir, "echo nope"), Vec::new());
            let err = transport.fetch_record_set("remote:saves").await.unwrap_err();
            assert!(matches!(err, TransportError::Decode(_)));
        }

        #[tokio::test]
        async fn test_failure_keeps_stderr() {
            let dir = TempDir::new().unwrap();
            let transport =
                RcloneTransport::new(fake_rclone(&dir, "echo quota exceeded >&2; exit 7"), Vec::new());
            let err = transport.copy("a:x", "b:y").await.unwrap_err();
            match err {
                TransportError::CommandFailed { status, stderr, .. } => {
                    assert_eq!(status, Some(7));
                    assert_eq!(stderr, "quota exceeded");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_purge_of_missing_dir_is_ok() {
            let dir = TempDir::new().unwrap();
            let transport = RcloneTransport::new(fake_rclone(&dir, "exit 3"), Vec::new());
            transport.purge("remote:gone").await.unwrap();
        }

        #[tokio::test]
        async fn test_arguments_are_passed_in_order() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("args.log");
            let script = format!("echo \"$@\" > {}", log.display());
            let transport = RcloneTransport::new(
                fake_rclone(&dir, &script),
                vec!["--config".into(), "/tmp/rclone.conf".into()],
            );

            transport
                .transfer(Path::new("/saves/a.sav"), "remote:x/a.sav", Direction::Download)
                .await
                .unwrap();
            let args = std::fs::read_to_string(&log).unwrap();
            assert_eq!(
                args.trim(),
                "copyto --config /tmp/rclone.conf remote:x/a.sav /saves/a.sav"
            );
        }
    }
}
