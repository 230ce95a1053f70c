//! sluice CLI
//!
//! Runs a pipeline once over local directories on an in-process cluster,
//! and checks pipeline and cluster configuration files.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use sluice_core::CommitId;
use sluice_pps::{ClusterConfig, JobRecord, JobStatus, LocalCluster, PipelineSpec, inputs};
use sluice_storage::VersionedStore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "sluice - versioned data pipelines", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "sluice=info")]
    log_level: String,
    /// Write logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline once over local directories
    Run {
        /// Pipeline spec (JSON)
        #[arg(short, long)]
        pipeline: PathBuf,
        /// Repository input contents, as NAME=DIR or DIR for the first input
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(Option<String>, PathBuf)>,
        /// Directory receiving the output commit's files
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Cluster configuration (JSON)
        #[arg(short, long, env = "SLUICE_CONFIG")]
        config: Option<PathBuf>,
        /// Seconds to wait for the job
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Check a pipeline spec without running it
    Validate {
        /// Pipeline spec (JSON)
        #[arg(short, long)]
        pipeline: PathBuf,
    },
    /// Print the effective cluster configuration
    Config {
        /// Cluster configuration (JSON)
        #[arg(short, long, env = "SLUICE_CONFIG")]
        config: Option<PathBuf>,
    },
}

/// `NAME=DIR` names the input; a bare `DIR` feeds the first repository input
fn parse_input(raw: &str) -> Result<(Option<String>, PathBuf), String> {
    if raw.is_empty() {
        return Err("empty input".to_string());
    }
    match raw.split_once('=') {
        Some((name, dir)) if is_input_name(name) => {
            if dir.is_empty() {
                return Err(format!("missing directory for input {}", name));
            }
            Ok((Some(name.to_string()), PathBuf::from(dir)))
        }
        _ => Ok((None, PathBuf::from(raw))),
    }
}

fn is_input_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Pair every directory with the repository input it feeds
fn bind_inputs(spec: &PipelineSpec, raw: &[(Option<String>, PathBuf)]) -> Result<Vec<(String, PathBuf)>> {
    let mut bound: Vec<(String, PathBuf)> = Vec::with_capacity(raw.len());
    for (name, dir) in raw {
        let name = match name {
            Some(name) => name.clone(),
            None => spec
                .repo_inputs()
                .next()
                .map(|(input, _, _)| input.name.clone())
                .ok_or_else(|| eyre!("pipeline {} has no repository input", spec.name))?,
        };
        if !spec.repo_inputs().any(|(input, _, _)| input.name == name) {
            bail!("pipeline {} has no repository input {}", spec.name, name);
        }
        if bound.iter().any(|(seen, _)| *seen == name) {
            bail!("input {} given twice", name);
        }
        bound.push((name, dir.clone()));
    }
    for (input, _, _) in spec.repo_inputs() {
        if !bound.iter().any(|(name, _)| *name == input.name) {
            bail!("repository input {} needs --input {}=DIR", input.name, input.name);
        }
    }
    Ok(bound)
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ClusterConfig> {
    let config = match path {
        Some(path) => ClusterConfig::from_file(path)
            .wrap_err_with(|| format!("cannot load cluster config {}", path.display()))?,
        None => ClusterConfig::new(),
    };
    config.validate()?;
    Ok(config)
}

async fn load_spec(path: &Path) -> Result<PipelineSpec> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("cannot read pipeline spec {}", path.display()))?;
    let spec: PipelineSpec =
        serde_json::from_str(&raw).wrap_err_with(|| format!("malformed pipeline spec {}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

/// Commit the files under `dir` to the head of a branch
async fn commit_dir(store: &VersionedStore, repo: &str, branch: &str, dir: &Path) -> Result<CommitId> {
    let tree = inputs::import_host_dir(store.content(), dir).await?;
    let commit = store.start_commit(repo, branch, None).await?;
    for (path, entry) in tree.iter() {
        let data = store.content().read(&entry.address)?;
        store.put_file(repo, &commit.id, path, data).await?;
    }
    store.finish_commit(repo, &commit.id).await?;
    info!(repo = %repo, commit = %commit.id, files = tree.len(), dir = %dir.display(), "committed input");
    Ok(commit.id)
}

/// Unpack a finished commit into `dir`
async fn export_commit(store: &VersionedStore, repo: &str, commit: &CommitId, dir: &Path) -> Result<()> {
    let stream = store.get_tar(repo, commit, "/").await?;
    tokio::fs::create_dir_all(dir).await?;
    tar::Archive::new(&stream[..])
        .unpack(dir)
        .wrap_err_with(|| format!("cannot write output to {}", dir.display()))?;
    Ok(())
}

/// Create the pipeline, commit its inputs and wait for the resulting job
async fn run_once(
    cluster: &LocalCluster,
    spec: PipelineSpec,
    inputs: &[(Option<String>, PathBuf)],
    output: Option<&Path>,
    timeout: Duration,
) -> Result<(JobRecord, JobStatus)> {
    let dirs = bind_inputs(&spec, inputs)?;
    let store = cluster.store();
    for (_, repo, _) in spec.repo_inputs() {
        match store.create_repo(repo, "").await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err.into()),
        }
    }

    let name = spec.name.clone();
    cluster.api().create_pipeline(spec.clone()).await?;
    for (input, repo, branch) in spec.repo_inputs() {
        if let Some((_, dir)) = dirs.iter().find(|(name, _)| *name == input.name) {
            commit_dir(store, repo, branch, dir).await?;
        }
    }

    let job = cluster.api().create_job(&name, &[]).await?;
    cluster.api().start_job(&job.id).await?;
    let status = cluster.wait_for_job(&job.id, timeout).await?;
    let job = cluster.api().inspect_job(&job.id).await?;

    if let (Some(dir), Some(commit)) = (output, job.output_commit) {
        if status != JobStatus::Killed {
            export_commit(store, &job.output_repo, &commit, dir).await?;
        }
    }
    Ok((job, status))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Run {
            pipeline,
            inputs,
            output,
            config,
            timeout,
        } => {
            let config = load_config(config.as_deref())?;
            let spec = load_spec(&pipeline).await?;
            let cluster = LocalCluster::start(config).await?;
            let result = run_once(&cluster, spec, &inputs, output.as_deref(), Duration::from_secs(timeout)).await;
            cluster.shutdown().await;
            let (job, status) = result?;

            let report = serde_json::json!({
                "job": job.id.to_string(),
                "pipeline": job.pipeline,
                "status": status,
                "reason": job.reason,
                "counts": job.counts,
                "output_commit": job.output_commit.map(|c| c.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            match status {
                JobStatus::Success => Ok(()),
                other => Err(eyre!("job {} ended {}", job.id, other)),
            }
        }
        Commands::Validate { pipeline } => {
            let spec = load_spec(&pipeline).await?;
            println!("pipeline {} is valid ({} inputs)", spec.name, spec.inputs.len());
            Ok(())
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sluice_pps::{InputSpec, Transform};
    use sluice_worker::Glob;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("raw=/tmp/x").unwrap(),
            (Some("raw".to_string()), PathBuf::from("/tmp/x"))
        );
        assert_eq!(parse_input("/tmp/x").unwrap(), (None, PathBuf::from("/tmp/x")));
        assert_eq!(parse_input("/tmp/a=b").unwrap(), (None, PathBuf::from("/tmp/a=b")));
        assert!(parse_input("raw=").is_err());
        assert!(parse_input("").is_err());
    }

    #[test]
    fn test_bind_inputs() {
        let spec = PipelineSpec::new("p", Transform::new("img", vec!["true".into()]))
            .with_input(InputSpec::repo("left", "l", "master", Glob::Root))
            .with_input(InputSpec::repo("right", "r", "master", Glob::Root));
        let bound = bind_inputs(
            &spec,
            &[(None, PathBuf::from("/a")), (Some("right".to_string()), PathBuf::from("/b"))],
        )
        .unwrap();
        assert_eq!(bound[0], ("left".to_string(), PathBuf::from("/a")));
        assert_eq!(bound[1], ("right".to_string(), PathBuf::from("/b")));

        assert!(bind_inputs(&spec, &[(None, PathBuf::from("/a"))]).is_err());
        assert!(bind_inputs(&spec, &[(None, PathBuf::from("/a")), (None, PathBuf::from("/b"))]).is_err());
        let unknown = [(Some("zz".to_string()), PathBuf::from("/a"))];
        assert!(bind_inputs(&spec, &unknown).is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "sluice", "run", "--pipeline", "p.json", "-i", "a=/x", "-i", "b=/y", "--timeout", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { inputs, timeout, output, .. } => {
                assert_eq!(inputs.len(), 2);
                assert_eq!(timeout, 5);
                assert!(output.is_none());
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.log_level, "sluice=info");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_once_round_trips_directories() {
        let input = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(input.path().join("docs")).unwrap();
        std::fs::write(input.path().join("docs/readme"), b"text").unwrap();
        let output = tempfile::tempdir().unwrap();

        let spec = PipelineSpec::new(
            "mirror",
            Transform::new(
                "busybox",
                vec!["sh".into(), "-c".into(), r#"cp -R "$SLUICE_INPUT_DIR/raw/." "$SLUICE_OUTPUT_DIR/""#.into()],
            ),
        )
        .with_input(InputSpec::repo("raw", "raw", "master", Glob::Root));

        let cluster = LocalCluster::start(ClusterConfig::new()).await.unwrap();
        let dirs = vec![(None, input.path().to_path_buf())];
        let (job, status) = run_once(&cluster, spec, &dirs, Some(output.path()), Duration::from_secs(30))
            .await
            .unwrap();
        cluster.shutdown().await;

        assert_eq!(status, JobStatus::Success);
        assert!(job.output_commit.is_some());
        assert_eq!(std::fs::read(output.path().join("docs/readme")).unwrap(), b"text");
    }

    #[tokio::test]
    async fn test_run_once_requires_every_repo_input() {
        let spec = PipelineSpec::new("p", Transform::new("img", vec!["true".into()]))
            .with_input(InputSpec::repo("raw", "raw", "master", Glob::Root));
        let cluster = LocalCluster::start(ClusterConfig::new()).await.unwrap();
        let err = run_once(&cluster, spec, &[], None, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("--input raw=DIR"));
        cluster.shutdown().await;
    }
}
