//! Local transport: commands run through a shell on this machine and the
//! "remote" filesystem is just the local one. Used for shared-filesystem
//! clusters and throughout the test suite.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::process::Command;

use super::base::{
    CommandOutput, CommandTransport, FileTransport, TransportError, TransportResult,
};

#[derive(Clone, Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn walk_files(root: &Path) -> TransportResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn copy_tree(src: &Path, dest: &Path, exist_okay: bool) -> TransportResult<()> {
    if !tokio::fs::metadata(src).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(TransportError::NotADirectory(src.to_path_buf()));
    }
    if tokio::fs::try_exists(dest).await? && !exist_okay {
        return Err(TransportError::AlreadyExists(dest.to_path_buf()));
    }
    let mut stack = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

impl CommandTransport for LocalTransport {
    fn invoke<'a>(
        &'a self,
        command: &'a str,
        interactive: bool,
    ) -> BoxFuture<'a, TransportResult<CommandOutput>> {
        Box::pin(async move {
            let mut cmd = Command::new("bash");
            cmd.arg("-c").arg(command);
            cmd.stdin(if interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            });
            let output = cmd.output().await?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        })
    }
}

impl FileTransport for LocalTransport {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>> {
        Box::pin(async move { Ok(tokio::fs::try_exists(path).await?) })
    }

    fn is_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>> {
        Box::pin(async move {
            Ok(tokio::fs::metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false))
        })
    }

    fn is_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>> {
        Box::pin(async move {
            Ok(tokio::fs::metadata(path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false))
        })
    }

    fn mkdir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { Ok(tokio::fs::create_dir(path).await?) })
    }

    fn makedirs<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { Ok(tokio::fs::create_dir_all(path).await?) })
    }

    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<u8>>> {
        Box::pin(async move { Ok(tokio::fs::read(path).await?) })
    }

    fn write<'a>(
        &'a self,
        path: &'a Path,
        contents: &'a [u8],
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            Ok(tokio::fs::write(path, contents).await?)
        })
    }

    fn list_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<String>>> {
        Box::pin(async move {
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names)
        })
    }

    fn walk<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<PathBuf>>> {
        Box::pin(walk_files(path))
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { Ok(tokio::fs::remove_file(path).await?) })
    }

    fn remove_tree<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { Ok(tokio::fs::remove_dir_all(path).await?) })
    }

    fn chmod_executable<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = tokio::fs::metadata(path).await?.permissions();
                perms.set_mode(perms.mode() | 0o755);
                tokio::fs::set_permissions(path, perms).await?;
            }
            Ok(())
        })
    }

    fn normpath(&self, path: &Path) -> PathBuf {
        // Lexical normalization only; the path may not exist yet.
        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        normalized.push(component.as_os_str());
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        normalized
    }

    fn send_tree<'a>(
        &'a self,
        src: &'a Path,
        dest: &'a Path,
        exist_okay: bool,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(copy_tree(src, dest, exist_okay))
    }

    fn receive_tree<'a>(
        &'a self,
        src: &'a Path,
        dest: &'a Path,
        exist_okay: bool,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(copy_tree(src, dest, exist_okay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_captures_output_and_exit_code() {
        let transport = LocalTransport::new();
        let output = transport.invoke("echo hello; exit 3", false).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout_str().trim(), "hello");
    }

    #[tokio::test]
    async fn tree_copy_is_recursive_and_guards_existing_dest() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("src");
        tokio::fs::create_dir_all(src.join("nested")).await.unwrap();
        tokio::fs::write(src.join("nested/file.txt"), b"data")
            .await
            .unwrap();

        let transport = LocalTransport::new();
        let dest = scratch.path().join("dest");
        transport.send_tree(&src, &dest, false).await.unwrap();
        assert_eq!(
            tokio::fs::read(dest.join("nested/file.txt")).await.unwrap(),
            b"data"
        );

        let err = transport.send_tree(&src, &dest, false).await.unwrap_err();
        assert!(matches!(err, TransportError::AlreadyExists(_)));
        transport.send_tree(&src, &dest, true).await.unwrap();
    }

    #[tokio::test]
    async fn walk_lists_files_recursively() {
        let scratch = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(scratch.path().join("a/b"))
            .await
            .unwrap();
        tokio::fs::write(scratch.path().join("a/b/x.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(scratch.path().join("top.txt"), b"t")
            .await
            .unwrap();

        let transport = LocalTransport::new();
        let files = transport.walk(scratch.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|p| p.ends_with("a/b/x.txt")));
    }

    #[test]
    fn normpath_resolves_dot_segments() {
        let transport = LocalTransport::new();
        assert_eq!(
            transport.normpath(Path::new("/root/./staging/../work")),
            PathBuf::from("/root/work")
        );
    }
}
