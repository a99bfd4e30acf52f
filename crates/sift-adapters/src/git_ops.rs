//! Git helpers: source excerpts, commit verification, remote discovery.

use anyhow::{Context, Result};
use git2::{ErrorCode, Repository};
use std::fs;
use std::path::{Component, Path, PathBuf};

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

/// Working-tree root of the repository containing `path`.
pub fn workdir(path: &Path) -> Result<PathBuf> {
    let repo = open_repo_discover(path)?;
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("Repository at '{}' is bare", path.display()))
}

/// Read a file's lines from the working tree. `Ok(None)` when the file is
/// absent or the path would leave the repository.
pub fn read_file_lines(repo_root: &Path, rel_path: &str) -> Result<Option<Vec<String>>> {
    let rel = Path::new(rel_path);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        tracing::warn!(path = rel_path, "refusing to read path outside the repository");
        return Ok(None);
    }

    let full_path = repo_root.join(rel);
    match fs::read(&full_path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(Some(text.lines().map(str::to_string).collect()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read '{}'", full_path.display())),
    }
}

/// Whether `commit_ref` (sha, short sha, branch, tag) resolves to a commit.
pub fn commit_exists(repo_path: &Path, commit_ref: &str) -> Result<bool> {
    let repo = open_repo_discover(repo_path)?;
    let object = match repo.revparse_single(commit_ref.trim()) {
        Ok(object) => object,
        Err(err)
            if matches!(
                err.code(),
                ErrorCode::NotFound | ErrorCode::Ambiguous | ErrorCode::InvalidSpec
            ) =>
        {
            return Ok(false)
        }
        Err(err) if err.class() == git2::ErrorClass::Reference => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let exists = object.peel_to_commit().is_ok();
    Ok(exists)
}

/// Extract owner and repo from a git remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo.git
/// - https://github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        return split_owner_repo(rest);
    }

    if url.contains("github.com") {
        if let Ok(parsed) = url::Url::parse(url) {
            if parsed.host_str() == Some("github.com") {
                return split_owner_repo(parsed.path().trim_start_matches('/'));
            }
        }
        let path = url
            .split("github.com")
            .nth(1)?
            .trim_start_matches(['/', ':']);
        return split_owner_repo(path);
    }

    None
}

fn split_owner_repo(path: &str) -> Option<(String, String)> {
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Owner and repo from the repository's GitHub remote.
pub fn get_remote_info(repo_path: &Path) -> Result<(String, String)> {
    let repo = open_repo_discover(repo_path)?;

    for remote_name in ["origin", "upstream", "github"] {
        if let Ok(remote) = repo.find_remote(remote_name) {
            if let Some(found) = remote.url().and_then(parse_remote_url) {
                return Ok(found);
            }
        }
    }

    if let Ok(remotes) = repo.remotes() {
        for name in remotes.iter().flatten() {
            if let Ok(remote) = repo.find_remote(name) {
                if let Some(found) = remote.url().and_then(parse_remote_url) {
                    return Ok(found);
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "No GitHub remote found. Make sure you have a remote pointing to github.com"
    ))
}
