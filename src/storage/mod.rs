//! Batched object get/put against an S3-compatible backend.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// A request to fetch one object into a local file.
#[derive(Clone, Debug)]
pub struct GetRequest {
    /// The object's name in the bucket.
    pub object_name: String,

    /// Local path the object is written to.
    pub file_path: PathBuf,
}

/// A request to upload one local file as an object.
#[derive(Clone, Debug)]
pub struct PutRequest {
    /// Local path of the file to upload.
    pub file_path: PathBuf,

    /// The object's name in the bucket.
    pub object_name: String,
}

/// Storage client over one of the supported backends, selected by URI
/// scheme: `file://<dir>` for a local directory, `http(s)://<endpoint>`
/// for an S3-compatible object endpoint with objects at `<endpoint>/<name>`.
pub enum StorageClient {
    Local { root: PathBuf },
    Http { base: String, client: reqwest::Client },
}

impl StorageClient {
    /// Create a client from a backend URI.
    ///
    /// * `uri` - The backend URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        if let Some(path) = uri.strip_prefix("file://") {
            Ok(StorageClient::Local {
                root: PathBuf::from(path),
            })
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Ok(StorageClient::Http {
                base: uri.trim_end_matches('/').to_string(),
                client: reqwest::Client::new(),
            })
        } else {
            Err(Error::StorageBackend(uri.to_string()))
        }
    }

    /// Fetch a batch of objects into local files.
    ///
    /// * `requests` - The objects to fetch.
    pub async fn get(&self, requests: &[GetRequest]) -> Result<()> {
        for request in requests {
            if let Some(parent) = request.file_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match self {
                StorageClient::Local { root } => {
                    let src = root.join(&request.object_name);
                    tokio::fs::copy(&src, &request.file_path).await.map_err(|e| {
                        Error::StorageFetch(format!("{}: {}", request.object_name, e))
                    })?;
                }
                StorageClient::Http { base, client } => {
                    let url = format!("{}/{}", base, request.object_name);
                    let response = client.get(&url).send().await?;
                    if !response.status().is_success() {
                        return Err(Error::StorageFetch(format!(
                            "{}: HTTP {}",
                            request.object_name,
                            response.status()
                        )));
                    }
                    let bytes = response.bytes().await?;
                    tokio::fs::write(&request.file_path, &bytes).await?;
                }
            }
        }
        Ok(())
    }

    /// Upload a batch of local files as objects.
    ///
    /// * `requests` - The files to upload.
    pub async fn put(&self, requests: &[PutRequest]) -> Result<()> {
        for request in requests {
            match self {
                StorageClient::Local { root } => {
                    let dest = root.join(&request.object_name);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(&request.file_path, &dest).await?;
                }
                StorageClient::Http { base, client } => {
                    let url = format!("{}/{}", base, request.object_name);
                    let bytes = tokio::fs::read(&request.file_path).await?;
                    let response = client.put(&url).body(bytes).send().await?;
                    if !response.status().is_success() {
                        return Err(Error::StorageFetch(format!(
                            "{}: HTTP {}",
                            request.object_name,
                            response.status()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Create a uniquely named scratch directory under the system temp dir.
///
/// * `prefix` - Directory name prefix.
pub fn scratch_dir(prefix: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "{}-{}-{:08x}",
        prefix,
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Join a directory and an object name.
///
/// * `dir`  - The directory.
/// * `name` - The object name.
pub fn object_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_backend_round_trips_objects() {
        let bucket = scratch_dir("cirrus-bucket").unwrap();
        let work = scratch_dir("cirrus-work").unwrap();

        std::fs::write(bucket.join("T1"), b"treelet payload").unwrap();

        let client = StorageClient::from_uri(&format!("file://{}", bucket.display())).unwrap();
        client
            .get(&[GetRequest {
                object_name: "T1".to_string(),
                file_path: work.join("T1"),
            }])
            .await
            .unwrap();
        assert_eq!(std::fs::read(work.join("T1")).unwrap(), b"treelet payload");

        std::fs::write(work.join("log"), b"worker log").unwrap();
        client
            .put(&[PutRequest {
                file_path: work.join("log"),
                object_name: "logs/1".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(std::fs::read(bucket.join("logs/1")).unwrap(), b"worker log");

        std::fs::remove_dir_all(bucket).ok();
        std::fs::remove_dir_all(work).ok();
    }

    #[tokio::test]
    async fn missing_object_is_a_fetch_error() {
        let bucket = scratch_dir("cirrus-bucket").unwrap();
        let client = StorageClient::from_uri(&format!("file://{}", bucket.display())).unwrap();
        let err = client
            .get(&[GetRequest {
                object_name: "T404".to_string(),
                file_path: bucket.join("T404.local"),
            }])
            .await;
        assert!(matches!(err, Err(Error::StorageFetch(_))));
        std::fs::remove_dir_all(bucket).ok();
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(StorageClient::from_uri("ftp://bucket").is_err());
    }
}
