//! Tar-stream transfer of file trees into and out of commits.

use crate::store::{ContentStore, StoreError};
use crate::tree::{FileTree, normalize_path};
use bytes::Bytes;
use sluice_core::CoreResult;
use std::io::Read;

fn tar_error(err: std::io::Error) -> StoreError {
    StoreError::Tar(err.to_string())
}

/// Encode the files of `tree` as an uncompressed tar stream.
///
/// Entry names are the tree paths without their leading `/`.
///
/// # Errors
///
/// Returns error if a blob is missing or the archive cannot be written
pub fn encode_tree(store: &ContentStore, tree: &FileTree) -> CoreResult<Vec<u8>> {
    let mut builder = ::tar::Builder::new(Vec::new());
    for (path, entry) in tree.iter() {
        let data = store.read(&entry.address)?;
        let mut header = ::tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, path.trim_start_matches('/'), &data[..])
            .map_err(tar_error)?;
    }
    Ok(builder.into_inner().map_err(tar_error)?)
}

/// Decode a tar stream into `(path, content)` pairs in archive order.
///
/// Non-regular entries (directories, links) are skipped.
///
/// # Errors
///
/// Returns error if the stream is malformed or holds an invalid path
pub fn decode_entries(stream: &[u8]) -> CoreResult<Vec<(String, Bytes)>> {
    let mut archive = ::tar::Archive::new(stream);
    let mut out = Vec::new();
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path().map_err(tar_error)?.to_string_lossy().into_owned();
        let path = normalize_path(&raw)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(tar_error)?;
        out.push((path, Bytes::from(data)));
    }
    Ok(out)
}
