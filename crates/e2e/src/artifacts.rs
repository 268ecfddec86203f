//! Per-attempt artifact directories and capture retention

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{ScreenshotMode, VideoMode};
use crate::error::E2eResult;

/// File name of the screenshot taken when an attempt finishes
pub const FINAL_SCREENSHOT: &str = "test-finished-1.png";

/// Directory holding recorded videos inside an attempt directory
pub const VIDEO_DIR: &str = "videos";

/// Stable short id for a test, derived from where it lives and which project runs it
pub fn test_id(file: &str, title: &str, project: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update([0]);
    hasher.update(title.as_bytes());
    hasher.update([0]);
    hasher.update(project.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..5].to_string()
}

/// Lowercase ASCII slug; non-ASCII titles fall back to `test`
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut dash = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }

    let slug: String = slug.trim_end_matches('-').chars().take(60).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "test".to_string()
    } else {
        slug
    }
}

/// `<file-stem>-<test-slug>-<project>-<id>[-retryN]`
pub fn attempt_dir(output_dir: &Path, file: &str, name: &str, project: &str, id: &str, retry: u32) -> PathBuf {
    let stem = file
        .rsplit('/')
        .next()
        .unwrap_or(file)
        .split('.')
        .next()
        .unwrap_or(file);

    let mut dir = format!("{}-{}-{}-{}", slugify(stem), slugify(name), slugify(project), id);
    if retry > 0 {
        dir.push_str(&format!("-retry{}", retry));
    }
    output_dir.join(dir)
}

/// Artifacts kept after retention was applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retained {
    pub screenshot: Option<PathBuf>,
    pub videos: Vec<PathBuf>,
}

/// Apply capture policy to what an attempt left in `dir`.
///
/// Files the policy does not keep are removed; an attempt directory left
/// empty is removed as well.
pub fn retain(dir: &Path, screenshot: ScreenshotMode, video: VideoMode, failed: bool) -> E2eResult<Retained> {
    let mut retained = Retained::default();

    let shot = dir.join(FINAL_SCREENSHOT);
    if shot.exists() {
        if screenshot.keep(failed) {
            retained.screenshot = Some(shot);
        } else {
            std::fs::remove_file(&shot)?;
        }
    }

    let videos = dir.join(VIDEO_DIR);
    if videos.is_dir() {
        if video.keep(failed) {
            for entry in std::fs::read_dir(&videos)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "webm").unwrap_or(false) {
                    retained.videos.push(path);
                }
            }
            retained.videos.sort();
        } else {
            debug!("Discarding video for passed attempt in {}", dir.display());
            std::fs::remove_dir_all(&videos)?;
        }
    }

    if dir.is_dir() && std::fs::read_dir(dir)?.next().is_none() {
        if let Err(e) = std::fs::remove_dir(dir) {
            warn!("Could not remove empty artifact dir {}: {}", dir.display(), e);
        }
    }

    Ok(retained)
}
