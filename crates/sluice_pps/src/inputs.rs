//! Resolving a pipeline's inputs into commit sets and datum trees.

use crate::job::{InputCommit, InputOrigin};
use crate::pipeline::{InputSource, PipelineSpec};
use sluice_core::{CommitId, CoreError, CoreResult};
use sluice_storage::{ContentStore, FileEntry, FileTree, VersionedStore};
use sluice_worker::InputTree;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Import a host directory into the content store, returning its tree.
/// Paths are relative to `root`, with `/` separators.
///
/// # Errors
///
/// Returns `NotFound` if `root` is not a directory, or any read error
pub async fn import_host_dir(content: &ContentStore, root: &Path) -> CoreResult<FileTree> {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(CoreError::not_found("host directory", root.display())),
    }

    let mut tree = FileTree::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| CoreError::internal(e.to_string()))?;
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let data = tokio::fs::read(&path).await?;
                let size = data.len() as u64;
                let address = content.write(data)?;
                tree.insert(&format!("/{}", name), FileEntry { address, size })?;
            }
        }
    }
    debug!(path = %root.display(), files = tree.len(), "imported host directory");
    Ok(tree)
}

/// Build the input commit set for a trigger.
///
/// Inputs named in `pinned` use that commit; other branch inputs use
/// their branch's latest finished commit; host directories are imported
/// and pinned by digest. Returns `None` while some branch input has no
/// finished commit yet.
///
/// # Errors
///
/// Returns `Validation` for a pinned input the pipeline does not have or
/// a pinned commit that is still open, `NotFound` for unknown commits
pub async fn resolve(
    store: &VersionedStore,
    spec: &PipelineSpec,
    pinned: &[(String, CommitId)],
) -> CoreResult<Option<Vec<InputCommit>>> {
    let pins: BTreeMap<&str, CommitId> = pinned.iter().map(|(name, id)| (name.as_str(), *id)).collect();
    for name in pins.keys() {
        if !spec.inputs.iter().any(|input| input.name == *name) {
            return Err(CoreError::validation(
                "inputs",
                format!("pipeline {} has no input {:?}", spec.name, name),
            ));
        }
    }

    let mut commits = Vec::with_capacity(spec.inputs.len());
    for input in &spec.inputs {
        match &input.source {
            InputSource::Repo { repo, branch, .. } => {
                let commit = match pins.get(input.name.as_str()) {
                    Some(id) => {
                        let info = store.inspect_commit(repo, id).await?;
                        if !info.is_finished() {
                            return Err(CoreError::validation(
                                "inputs",
                                format!("commit {} of {} is not finished", id, repo),
                            ));
                        }
                        info
                    }
                    None => match store.latest_finished(repo, branch).await? {
                        Some(info) => info,
                        None => return Ok(None),
                    },
                };
                commits.push(InputCommit::commit(&input.name, repo, commit.id));
            }
            InputSource::HostDir { path, .. } => {
                let tree = import_host_dir(store.content(), path).await?;
                commits.push(InputCommit {
                    input: input.name.clone(),
                    source: InputOrigin::HostDir {
                        path: path.clone(),
                        digest: tree.digest().to_hex(),
                    },
                });
            }
        }
    }
    Ok(Some(commits))
}

/// Load the file trees of a job's inputs, paired with each input's glob.
///
/// # Errors
///
/// Returns `NotFound` if a commit vanished, or `Validation` if a host
/// directory changed since the job was created
pub async fn load_trees(
    store: &VersionedStore,
    spec: &PipelineSpec,
    commits: &[InputCommit],
) -> CoreResult<Vec<InputTree>> {
    let mut trees = Vec::with_capacity(commits.len());
    for commit in commits {
        let input = spec
            .inputs
            .iter()
            .find(|input| input.name == commit.input)
            .ok_or_else(|| CoreError::not_found("input", &commit.input))?;
        let tree = match &commit.source {
            InputOrigin::Commit { repo, commit } => store.get_tree(repo, commit).await?,
            InputOrigin::HostDir { path, digest } => {
                let tree = import_host_dir(store.content(), path).await?;
                if tree.digest().to_hex() != *digest {
                    return Err(CoreError::validation(
                        "inputs",
                        format!("host directory {} changed since the job was created", path.display()),
                    ));
                }
                tree
            }
        };
        trees.push(InputTree {
            name: input.name.clone(),
            tree,
            glob: input.source.glob(),
        });
    }
    Ok(trees)
}
