//! Object store driven by the storage CLI over command transports.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backends::{check_call, CommandTransport};

use super::{
    bucket_of, is_object_url, ObjectStore, StorageError, StorageResult, TransferContext,
    COPY_OPTS, OBJECT_SCHEME,
};

const PAYS_MARKER: &str = "requester pays bucket but no user project provided";
const BUCKET_NOT_FOUND: &str = "BucketNotFoundException: 404";

/// Shells storage commands through the local or remote command transport.
/// Requester-pays classification is probed on the remote side (scope
/// differences can make a bucket readable from one side only) and cached for
/// the lifetime of this store.
pub struct ShellObjectStore {
    local: Arc<dyn CommandTransport>,
    remote: Arc<dyn CommandTransport>,
    project: Option<String>,
    pays_cache: Mutex<HashMap<String, bool>>,
}

impl ShellObjectStore {
    pub fn new(
        local: Arc<dyn CommandTransport>,
        remote: Arc<dyn CommandTransport>,
        project: Option<String>,
    ) -> Self {
        Self {
            local,
            remote,
            project,
            pays_cache: Mutex::new(HashMap::new()),
        }
    }

    fn transport(&self, context: TransferContext) -> &dyn CommandTransport {
        match context {
            TransferContext::Local => self.local.as_ref(),
            TransferContext::Remote => self.remote.as_ref(),
        }
    }

    /// Classify a bucket as requester-pays. The cache lock is held across
    /// the probe so each bucket is queried at most once even when many jobs
    /// resolve concurrently.
    async fn requester_pays(&self, url: &str) -> StorageResult<bool> {
        let stripped = url.strip_prefix(OBJECT_SCHEME).unwrap_or(url);
        let Some(bucket) = bucket_of(url).or_else(|| {
            let b = stripped.split('/').next().unwrap_or("");
            (!b.is_empty()).then_some(b)
        }) else {
            return Ok(false);
        };

        let mut cache = self.pays_cache.lock().await;
        if let Some(&pays) = cache.get(bucket) {
            return Ok(pays);
        }

        let command = format!("gsutil requesterpays get {OBJECT_SCHEME}{bucket}");
        let output = self.remote.invoke(&command, false).await?;
        let stderr = output.stderr_str();
        let not_found = stderr.contains(BUCKET_NOT_FOUND);

        let pays = if output.success() || !not_found {
            stderr.contains(PAYS_MARKER)
                || output
                    .stdout_str()
                    .contains(&format!("{OBJECT_SCHEME}{bucket}: Enabled"))
        } else {
            // Bucket inspection can be denied while object inspection is
            // allowed; fall back to listing the object itself.
            let probe = format!("gsutil ls {OBJECT_SCHEME}{stripped}");
            let probe_output = self.remote.invoke(&probe, false).await?;
            let pays = probe_output.stderr_str().contains(PAYS_MARKER);
            if output.exit_code == 1 {
                return Err(StorageError::BucketNotFound {
                    url: url.to_string(),
                });
            }
            pays
        };

        debug!(bucket, pays, "classified bucket");
        cache.insert(bucket.to_string(), pays);
        Ok(pays)
    }

    async fn billing_flag(&self, url: &str) -> StorageResult<String> {
        let gs_side = if is_object_url(url) { url } else { "" };
        if gs_side.is_empty() {
            return Ok(String::new());
        }
        match (self.requester_pays(gs_side).await?, &self.project) {
            (true, Some(project)) => Ok(format!("-u {project} ")),
            _ => Ok(String::new()),
        }
    }
}

impl ObjectStore for ShellObjectStore {
    fn size<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move {
            let flag = self.billing_flag(url).await?;
            let command = format!("gsutil {flag}du -s {url}");
            let output = self.remote.invoke(&command, false).await?;
            check_call(&command, &output)?;
            let stdout = output.stdout_str();
            stdout
                .split_whitespace()
                .next()
                .and_then(|token| token.parse().ok())
                .ok_or_else(|| StorageError::SizeParse {
                    url: url.to_string(),
                    output: stdout,
                })
        })
    }

    fn list_objects<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let flag = self.billing_flag(url).await?;
            let command = format!("gsutil {flag}ls {url}");
            let output = self.local.invoke(&command, false).await?;
            if !output.success() {
                return Ok(Vec::new());
            }
            Ok(output
                .stdout_str()
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect())
        })
    }

    fn user_project<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            if self.requester_pays(url).await? {
                Ok(self.project.clone())
            } else {
                Ok(None)
            }
        })
    }

    fn copy<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let gs_side = if is_object_url(src) { src } else { dest };
            let flag = self.billing_flag(gs_side).await?;
            let command = format!("gsutil {COPY_OPTS} {flag}cp {src} {dest}");
            let interactive = context == TransferContext::Remote;
            let output = self.transport(context).invoke(&command, interactive).await?;
            check_call(&command, &output)?;
            Ok(())
        })
    }

    fn copy_tree<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let gs_side = if is_object_url(src) { src } else { dest };
            let flag = self.billing_flag(gs_side).await?;
            let command = format!("gsutil -m {COPY_OPTS} {flag}cp -r {src} {dest}");
            let interactive = context == TransferContext::Remote;
            let output = self.transport(context).invoke(&command, interactive).await?;
            check_call(&command, &output)?;
            Ok(())
        })
    }

    fn remove_tree<'a>(
        &'a self,
        url: &'a str,
        context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let flag = self.billing_flag(url).await?;
            let command = format!("gsutil -m {flag}rm -r {url}");
            let output = self.transport(context).invoke(&command, false).await?;
            check_call(&command, &output)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use futures::future::BoxFuture;

    use crate::backends::{CommandOutput, TransportResult};

    use super::*;

    /// Records invoked commands and replays scripted outputs.
    struct ScriptedTransport {
        calls: StdMutex<Vec<String>>,
        outputs: StdMutex<Vec<CommandOutput>>,
    }

    impl ScriptedTransport {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                outputs: StdMutex::new(outputs),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandTransport for ScriptedTransport {
        fn invoke<'a>(
            &'a self,
            command: &'a str,
            _interactive: bool,
        ) -> BoxFuture<'a, TransportResult<CommandOutput>> {
            self.calls.lock().unwrap().push(command.to_string());
            let output = {
                let mut outputs = self.outputs.lock().unwrap();
                if outputs.is_empty() {
                    CommandOutput::default()
                } else {
                    outputs.remove(0)
                }
            };
            Box::pin(async move { Ok(output) })
        }
    }

    fn enabled_output(bucket: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: format!("gs://{bucket}: Enabled\n").into_bytes(),
            stderr: Vec::new(),
        }
    }

    #[tokio::test]
    async fn requester_pays_is_probed_once_per_bucket() {
        let remote = Arc::new(ScriptedTransport::new(vec![enabled_output("b")]));
        let store = ShellObjectStore::new(
            Arc::new(ScriptedTransport::new(Vec::new())),
            remote.clone(),
            Some("proj".into()),
        );

        for _ in 0..3 {
            let project = store.user_project("gs://b/obj").await.unwrap();
            assert_eq!(project.as_deref(), Some("proj"));
        }
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_bucket_is_an_error() {
        let remote = Arc::new(ScriptedTransport::new(vec![
            CommandOutput {
                exit_code: 1,
                stdout: Vec::new(),
                stderr: format!("{BUCKET_NOT_FOUND}\n").into_bytes(),
            },
            CommandOutput::default(),
        ]));
        let store = ShellObjectStore::new(
            Arc::new(ScriptedTransport::new(Vec::new())),
            remote,
            None,
        );
        let err = store.user_project("gs://missing/obj").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound { .. }));
    }

    #[tokio::test]
    async fn size_parses_first_token() {
        let remote = Arc::new(ScriptedTransport::new(vec![
            CommandOutput {
                exit_code: 0,
                stdout: b"gs://b: Disabled\n".to_vec(),
                stderr: Vec::new(),
            },
            CommandOutput {
                exit_code: 0,
                stdout: b"123456  gs://b/obj\n".to_vec(),
                stderr: Vec::new(),
            },
        ]));
        let store = ShellObjectStore::new(
            Arc::new(ScriptedTransport::new(Vec::new())),
            remote,
            None,
        );
        assert_eq!(store.size("gs://b/obj").await.unwrap(), 123456);
    }
}
