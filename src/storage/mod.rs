//! Object-storage client: URL helpers, the store interface, and the command
//! strings other modules render into job scripts.

mod shell;

use std::path::Path;

use futures::future::BoxFuture;

use crate::backends::TransportError;

pub use shell::ShellObjectStore;

/// Scheme prefix marking a remote object reference.
pub const OBJECT_SCHEME: &str = "gs://";

/// Storage-CLI options applied to every copy.
pub const COPY_OPTS: &str =
    "-o GSUtil:check_hashes=if_fast_else_skip -o GSUtil:parallel_composite_upload_threshold=150M";

/// True when the value denotes a remote object rather than a local path or
/// plain argument.
pub fn is_object_url(value: &str) -> bool {
    value.starts_with(OBJECT_SCHEME)
}

/// Bucket component of an object URL.
pub fn bucket_of(url: &str) -> Option<&str> {
    let rest = url.strip_prefix(OBJECT_SCHEME)?;
    let bucket = rest.split('/').next().unwrap_or(rest);
    (!bucket.is_empty()).then_some(bucket)
}

/// Final path component of an object URL or filesystem path, used to name
/// localized copies.
pub fn basename(value: &str) -> &str {
    value
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(value)
}

/// Where a storage command should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferContext {
    /// On the invoking machine.
    Local,
    /// On the cluster side, where the staging root lives.
    Remote,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not parse object size for {url}: `{output}`")]
    SizeParse { url: String, output: String },
    #[error("bucket not found for {url}")]
    BucketNotFound { url: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Client for the object store backing remote inputs and the optional
/// transfer bucket. Implementations must be safe to share across concurrent
/// job preparation.
pub trait ObjectStore: Send + Sync {
    /// Total bytes of the object, or of all objects under a directory URL.
    fn size<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<u64>>;

    /// Object URLs at or under the given URL. A missing object lists as
    /// empty.
    fn list_objects<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Vec<String>>>;

    /// True when the URL names a prefix with children rather than an object:
    /// the listing is non-empty and never lists the URL itself.
    fn is_directory<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let objects = self.list_objects(url).await?;
            if objects.is_empty() {
                return Ok(false);
            }
            Ok(!objects
                .iter()
                .any(|object| object.trim_end_matches('/') == url.trim_end_matches('/')))
        })
    }

    /// Billing project to charge for access, when the object's bucket is
    /// requester-pays. Classification is cached per bucket.
    fn user_project<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;

    /// Copy one object between the store and a filesystem path (either
    /// direction), running in the given context.
    fn copy<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Recursive copy of a directory tree.
    fn copy_tree<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Delete a remote prefix recursively.
    fn remove_tree<'a>(
        &'a self,
        url: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>>;
}

fn billing_flag(user_project: Option<&str>) -> String {
    match user_project {
        Some(project) => format!("-u {project} "),
        None => String::new(),
    }
}

/// Command that checks an object exists, for the head of a stream sequence.
pub fn object_check_command(url: &str) -> String {
    format!("gsutil ls {} > /dev/null", crate::localization::sh_quote(url))
}

/// Command that streams an object into a named pipe, backgrounded.
pub fn cat_command(url: &str, dest: &str, user_project: Option<&str>) -> String {
    format!(
        "gsutil {}cat {} > {} &",
        billing_flag(user_project),
        crate::localization::sh_quote(url),
        dest
    )
}

/// Idempotent download guarded by a `.fin` marker so retried localization
/// phases do not transfer twice.
pub fn guarded_download_command(url: &str, dest: &str, user_project: Option<&str>) -> String {
    format!(
        "if [[ ! -e {dest}.fin ]]; then gsutil {flag}-o GSUtil:check_hashes=if_fast_else_skip cp {url} {dest} && touch {dest}.fin; fi",
        dest = dest,
        flag = billing_flag(user_project),
        url = crate::localization::sh_quote(url),
    )
}

/// Join an object URL with a relative suffix.
pub fn join_url(base: &str, suffix: &Path) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        suffix.to_string_lossy().trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection_rejects_local_paths() {
        assert!(is_object_url("gs://bucket/obj"));
        assert!(!is_object_url("/tmp/file"));
        assert!(!is_object_url("plain-value"));
    }

    #[test]
    fn bucket_and_basename() {
        assert_eq!(bucket_of("gs://bucket/a/b"), Some("bucket"));
        assert_eq!(bucket_of("gs://"), None);
        assert_eq!(basename("gs://bucket/a/b.bam"), "b.bam");
        assert_eq!(basename("/local/dir/"), "dir");
    }

    #[test]
    fn guarded_download_embeds_marker() {
        let cmd = guarded_download_command("gs://b/o", "/dest/o", Some("proj"));
        assert!(cmd.contains("/dest/o.fin"));
        assert!(cmd.contains("-u proj"));
        assert!(cmd.contains("touch /dest/o.fin"));
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("gs://bucket/base/", Path::new("scratch/out")),
            "gs://bucket/base/scratch/out"
        );
    }
}
