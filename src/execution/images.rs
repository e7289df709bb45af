//! Image naming and acquisition.
//!
//! Prebuilt images are tagged locally as `featbench_<repo>:<tag>` and
//! published under a registry prefix. Acquiring an image means using the
//! local tag when present, else pulling the remote name and retagging it.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::corpus::Instance;
use crate::error::DockerError;
use crate::execution::runtime::ContainerRuntime;

/// Local image name for an instance.
///
/// An explicit `docker_image` in the corpus wins. Otherwise the tag is the
/// instance number when known, else the sanitized instance id.
pub fn local_image_name(instance: &Instance) -> String {
    if let Some(image) = instance.docker_image.as_deref().filter(|s| !s.is_empty()) {
        return image.to_string();
    }
    let repo = instance.repo.replace('/', "_").to_lowercase();
    let tag = match instance.number {
        Some(number) => number.to_string(),
        None => sanitize_tag(&instance.instance_id),
    };
    format!("featbench_{repo}:{tag}")
}

/// Registry name for a local image name.
///
/// Names that already carry a registry or namespace (contain `/` and are not
/// `featbench_` images) are used as-is.
pub fn remote_image_name(local: &str, registry_prefix: &str) -> String {
    if local.contains('/') && !local.starts_with("featbench_") {
        return local.to_string();
    }
    format!("{}/{}", registry_prefix.trim_end_matches('/'), local)
}

fn sanitize_tag(raw: &str) -> String {
    let tag: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(128)
        .collect();
    if tag.is_empty() {
        "latest".to_string()
    } else {
        tag
    }
}

/// How an image became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Already present locally.
    Present,
    /// Pulled from the registry and retagged.
    Pulled,
    /// Would be pulled (dry run).
    Missing,
}

/// Makes `local` available, pulling `<registry_prefix>/<local>` when absent.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    local: &str,
    registry_prefix: &str,
) -> Result<ImageStatus, DockerError> {
    if runtime.image_exists(local).await? {
        return Ok(ImageStatus::Present);
    }

    let remote = remote_image_name(local, registry_prefix);
    info!(image = %local, remote = %remote, "Pulling image");
    runtime.pull_image(&remote).await?;
    if remote != local {
        runtime.tag_image(&remote, local).await?;
    }
    Ok(ImageStatus::Pulled)
}

/// Outcome of acquiring one image in build-only mode.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePullReport {
    pub image: String,
    pub status: Option<ImageStatus>,
    pub error: Option<String>,
}

/// Aggregate of a build-only run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildSummary {
    pub total: usize,
    pub present: usize,
    pub pulled: usize,
    pub missing: usize,
    pub failed: usize,
    pub reports: Vec<ImagePullReport>,
}

/// Ensures every distinct image of `instances` is available locally.
///
/// Runs at most `concurrency` pulls at once. With `dry_run`, only reports
/// which images are missing.
pub async fn pull_images(
    runtime: Arc<dyn ContainerRuntime>,
    instances: &[Instance],
    registry_prefix: &str,
    concurrency: usize,
    dry_run: bool,
) -> BuildSummary {
    let mut images: Vec<String> = instances.iter().map(local_image_name).collect();
    images.sort();
    images.dedup();

    let reports: Vec<ImagePullReport> = stream::iter(images)
        .map(|image| {
            let runtime = Arc::clone(&runtime);
            async move {
                let result = if dry_run {
                    match runtime.image_exists(&image).await {
                        Ok(true) => Ok(ImageStatus::Present),
                        Ok(false) => Ok(ImageStatus::Missing),
                        Err(e) => Err(e),
                    }
                } else {
                    ensure_image(runtime.as_ref(), &image, registry_prefix).await
                };
                match result {
                    Ok(status) => ImagePullReport {
                        image,
                        status: Some(status),
                        error: None,
                    },
                    Err(e) => {
                        warn!(image = %image, error = %e, "Image acquisition failed");
                        ImagePullReport {
                            image,
                            status: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut summary = BuildSummary {
        total: reports.len(),
        ..Default::default()
    };
    for report in &reports {
        match report.status {
            Some(ImageStatus::Present) => summary.present += 1,
            Some(ImageStatus::Pulled) => summary.pulled += 1,
            Some(ImageStatus::Missing) => summary.missing += 1,
            None => summary.failed += 1,
        }
    }
    summary.reports = reports;
    summary
}
