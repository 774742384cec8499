//! Transport interfaces the localization engine is written against: a
//! command runner and a filesystem, each usable behind `dyn`.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("command `{command}` failed with exit code {exit_code}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("destination already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("{0}")]
    Unsupported(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Captured output of one invoked command.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Fail on a nonzero exit code, surfacing the command's stderr.
pub fn check_call(command: &str, output: &CommandOutput) -> TransportResult<()> {
    if output.success() {
        return Ok(());
    }
    let stderr = output.stderr_str();
    warn!(command, exit_code = output.exit_code, %stderr, "command failed");
    Err(TransportError::CommandFailed {
        command: command.to_string(),
        exit_code: output.exit_code,
        stderr,
    })
}

/// Runs commands where the cluster can see them. `interactive` asks the
/// transport to wire the invoking terminal through to the command.
pub trait CommandTransport: Send + Sync {
    fn invoke<'a>(
        &'a self,
        command: &'a str,
        interactive: bool,
    ) -> BoxFuture<'a, TransportResult<CommandOutput>>;
}

/// Filesystem operations over a transport root. Paths are interpreted by the
/// implementation; the engine never assumes both sides share a filesystem.
pub trait FileTransport: Send + Sync {
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>>;

    fn is_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>>;

    fn is_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<bool>>;

    fn mkdir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>>;

    fn makedirs<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>>;

    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<u8>>>;

    fn write<'a>(
        &'a self,
        path: &'a Path,
        contents: &'a [u8],
    ) -> BoxFuture<'a, TransportResult<()>>;

    /// Entries (names, not paths) of one directory.
    fn list_dir<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<String>>>;

    /// Every file under `path`, recursively.
    fn walk<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<Vec<PathBuf>>>;

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>>;

    fn remove_tree<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>>;

    fn chmod_executable<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, TransportResult<()>>;

    /// Normalize a path the way the remote side will resolve it.
    fn normpath(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    /// Copy a local directory tree into this transport's filesystem.
    /// Fails if `dest` exists, unless `exist_okay`.
    fn send_tree<'a>(
        &'a self,
        src: &'a Path,
        dest: &'a Path,
        exist_okay: bool,
    ) -> BoxFuture<'a, TransportResult<()>>;

    /// Copy a directory tree from this transport's filesystem to a local
    /// destination. Fails if `dest` exists, unless `exist_okay`.
    fn receive_tree<'a>(
        &'a self,
        src: &'a Path,
        dest: &'a Path,
        exist_okay: bool,
    ) -> BoxFuture<'a, TransportResult<()>>;
}
