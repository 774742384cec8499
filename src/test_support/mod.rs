//! Shared fixtures for tests: an in-memory object store that materializes
//! downloads as real files, so engine tests run without a storage backend.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;

use crate::storage::{ObjectStore, StorageResult, TransferContext, OBJECT_SCHEME};

/// Objects are byte blobs keyed by full URL. Copies with a filesystem
/// destination write real files; copies with an object destination read
/// real files back in.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pays_buckets: Mutex<HashSet<String>>,
    project: Option<String>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            ..Self::default()
        }
    }

    pub fn put_object(&self, url: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
    }

    pub fn mark_requester_pays(&self, bucket: &str) {
        self.pays_buckets.lock().unwrap().insert(bucket.to_string());
    }

    pub fn object(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(url).cloned()
    }

    pub fn object_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        urls.sort();
        urls
    }

    fn children_of(&self, url: &str) -> Vec<(String, Vec<u8>)> {
        let prefix = format!("{}/", url.trim_end_matches('/'));
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)
}

impl ObjectStore for MemoryObjectStore {
    fn size<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move {
            let objects = self.objects.lock().unwrap();
            if let Some(bytes) = objects.get(url) {
                return Ok(bytes.len() as u64);
            }
            let prefix = format!("{}/", url.trim_end_matches('/'));
            Ok(objects
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(_, value)| value.len() as u64)
                .sum())
        })
    }

    fn list_objects<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let mut listed = Vec::new();
            if self.objects.lock().unwrap().contains_key(url) {
                listed.push(url.to_string());
            }
            listed.extend(self.children_of(url).into_iter().map(|(key, _)| key));
            listed.sort();
            Ok(listed)
        })
    }

    fn user_project<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            let bucket = crate::storage::bucket_of(url).unwrap_or_default().to_string();
            let pays = self.pays_buckets.lock().unwrap().contains(&bucket);
            Ok(if pays { self.project.clone() } else { None })
        })
    }

    fn copy<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        _context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if src.starts_with(OBJECT_SCHEME) {
                let bytes = self.object(src).unwrap_or_default();
                write_file(Path::new(dest), &bytes).map_err(crate::backends::TransportError::from)?;
            } else {
                let bytes =
                    std::fs::read(src).map_err(crate::backends::TransportError::from)?;
                self.put_object(dest, &bytes);
            }
            Ok(())
        })
    }

    fn copy_tree<'a>(
        &'a self,
        src: &'a str,
        dest: &'a str,
        _context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            if src.starts_with(OBJECT_SCHEME) {
                // The tree lands under dest/<basename>, mirroring a
                // recursive CLI copy.
                let base = crate::storage::basename(src);
                for (url, bytes) in self.children_of(src) {
                    let relative = url
                        .strip_prefix(&format!("{}/", src.trim_end_matches('/')))
                        .unwrap_or(&url)
                        .to_string();
                    let target = PathBuf::from(dest).join(base).join(relative);
                    write_file(&target, &bytes)
                        .map_err(crate::backends::TransportError::from)?;
                }
            } else {
                let root = PathBuf::from(src);
                let mut stack = vec![root.clone()];
                while let Some(dir) = stack.pop() {
                    for entry in
                        std::fs::read_dir(&dir).map_err(crate::backends::TransportError::from)?
                    {
                        let entry = entry.map_err(crate::backends::TransportError::from)?;
                        let path = entry.path();
                        if path.is_dir() {
                            stack.push(path);
                        } else {
                            let relative = path
                                .strip_prefix(&root)
                                .unwrap_or(&path)
                                .to_string_lossy()
                                .into_owned();
                            let bytes = std::fs::read(&path)
                                .map_err(crate::backends::TransportError::from)?;
                            self.put_object(
                                &format!("{}/{}", dest.trim_end_matches('/'), relative),
                                &bytes,
                            );
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn remove_tree<'a>(
        &'a self,
        url: &'a str,
        _context: TransferContext,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let prefix = format!("{}/", url.trim_end_matches('/'));
            self.objects
                .lock()
                .unwrap()
                .retain(|key, _| key != url && !key.starts_with(&prefix));
            Ok(())
        })
    }
}
