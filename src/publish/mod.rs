use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::{PublishConfig, StorageConfig};

/// Copies a local file somewhere it can be served from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Returns a reference (URL or URI) to the uploaded object
    async fn upload(&self, path: &Path, destination: &str) -> Result<String>;
}

/// Version control publishing of generated files
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn publish(&self, paths: &[PathBuf], commit_message: &str) -> Result<()>;
}

pub struct S3Storage {
    client: S3Client,
    config: StorageConfig,
}

impl S3Storage {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            anyhow::bail!("storage.bucket must be configured");
        }

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        Ok(Self {
            client: S3Client::new(&aws_config),
            config,
        })
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
    async fn upload(&self, path: &Path, destination: &str) -> Result<String> {
        let key = object_key(self.config.prefix.as_deref(), destination);
        tracing::info!("Uploading {} to s3://{}/{}", path.display(), self.config.bucket, key);

        let content = fs_err::read(path)?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(content.into())
            .content_type("audio/mpeg")
            .send()
            .await
            .with_context(|| format!("Failed to upload {} to S3", path.display()))?;

        Ok(remote_ref(
            &self.config.bucket,
            self.config.public_base_url.as_deref(),
            &key,
        ))
    }
}

/// S3 key for `destination` under an optional prefix
pub fn object_key(prefix: Option<&str>, destination: &str) -> String {
    let destination = destination.trim_start_matches('/');
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, destination),
        None => destination.to_string(),
    }
}

/// Public URL when the bucket is served over HTTP, else an `s3://` URI
pub fn remote_ref(bucket: &str, public_base_url: Option<&str>, key: &str) -> String {
    let encoded = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    match public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), encoded),
        None => format!("s3://{}/{}", bucket, key),
    }
}

/// `git add` + `git commit` + `git push`
pub struct GitPublisher {
    repo_dir: Option<PathBuf>,
    remote: String,
    branch: String,
}

impl GitPublisher {
    pub fn new(config: &PublishConfig) -> Self {
        Self {
            repo_dir: config.repo_dir.clone(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        tracing::debug!("git {} (in {})", args.join(" "), dir.display());
        Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .await
            .context("Failed to run git")
    }
}

#[async_trait]
impl Vcs for GitPublisher {
    async fn publish(&self, paths: &[PathBuf], commit_message: &str) -> Result<()> {
        let dir = match (&self.repo_dir, paths.first().and_then(|p| p.parent())) {
            (Some(dir), _) => dir.clone(),
            (None, Some(parent)) => parent.to_path_buf(),
            (None, None) => anyhow::bail!("Nothing to publish"),
        };

        let mut add_args = vec!["add".to_string(), "--".to_string()];
        for path in paths {
            let path = std::path::absolute(path)
                .with_context(|| format!("Cannot resolve {}", path.display()))?;
            add_args.push(path.display().to_string());
        }
        let add_args: Vec<&str> = add_args.iter().map(String::as_str).collect();
        let output = self.git(&dir, &add_args).await?;
        if !output.status.success() {
            anyhow::bail!("git add failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }

        let output = self.git(&dir, &["commit", "-m", commit_message]).await?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if is_nothing_to_commit(&stdout) {
                tracing::info!("Nothing new to commit in {}", dir.display());
            } else {
                anyhow::bail!(
                    "git commit failed: {}{}",
                    stdout.trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        let output = self.git(&dir, &["push", &self.remote, &self.branch]).await?;
        if !output.status.success() {
            anyhow::bail!("git push failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }

        Ok(())
    }
}

fn is_nothing_to_commit(stdout: &str) -> bool {
    stdout.contains("nothing to commit") || stdout.contains("nothing added to commit")
}
