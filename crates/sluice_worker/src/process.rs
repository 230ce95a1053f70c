//! Transforms run as child processes.
//!
//! Each datum gets a scratch directory with `in/<input>/<path>` holding
//! its input files and an empty `out/`. Whatever the command leaves in
//! `out/` becomes the datum's output.

use crate::runner::{DatumFiles, DatumRunner, OutputFile, RunError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Environment variable naming the input directory
pub const INPUT_DIR_ENV: &str = "SLUICE_INPUT_DIR";
/// Environment variable naming the output directory
pub const OUTPUT_DIR_ENV: &str = "SLUICE_OUTPUT_DIR";
/// Environment variable carrying the datum ID
pub const DATUM_ID_ENV: &str = "SLUICE_DATUM_ID";

/// Runs a command per datum
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cmd: Vec<String>,
    stdin: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ProcessRunner {
    /// Create a runner for `cmd` (program followed by arguments)
    #[must_use]
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            stdin: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Lines written to the command's standard input
    #[must_use]
    pub fn with_stdin(mut self, lines: Vec<String>) -> Self {
        self.stdin = lines;
        self
    }

    /// Extra environment
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    async fn materialize(root: &Path, datum: &DatumFiles) -> Result<(), RunError> {
        for file in &datum.files {
            let target = root
                .join(&file.input)
                .join(file.path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.data).await?;
        }
        Ok(())
    }

    async fn feed(stdin: &mut tokio::process::ChildStdin, lines: &[String]) -> std::io::Result<()> {
        for line in lines {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        stdin.shutdown().await
    }

    async fn collect(out: &Path) -> Result<Vec<OutputFile>, RunError> {
        let mut files = Vec::new();
        let mut pending: Vec<PathBuf> = vec![out.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(out)
                    .map_err(|e| RunError::Transform(e.to_string()))?;
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let data = tokio::fs::read(&path).await?;
                files.push(OutputFile::new(format!("/{}", name), Bytes::from(data)));
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[async_trait]
impl DatumRunner for ProcessRunner {
    async fn run(&self, datum: &DatumFiles) -> Result<Vec<OutputFile>, RunError> {
        let Some((program, args)) = self.cmd.split_first() else {
            return Err(RunError::Transform("empty command".to_string()));
        };

        let scratch = tempfile::tempdir()?;
        let input_dir = scratch.path().join("in");
        let output_dir = scratch.path().join("out");
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;
        Self::materialize(&input_dir, datum).await?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(scratch.path())
            .envs(&self.env)
            .env(INPUT_DIR_ENV, &input_dir)
            .env(OUTPUT_DIR_ENV, &output_dir)
            .env(DATUM_ID_ENV, datum.datum.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that never reads stdin may exit before we finish.
            if let Err(err) = Self::feed(&mut stdin, &self.stdin).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RunError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let files = Self::collect(&output_dir).await?;
        debug!(datum = %datum.datum.short(), program = %program, outputs = files.len(), "process finished");
        Ok(files)
    }
}
