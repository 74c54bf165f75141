//! kvsnap CLI: save, delete and list store snapshots

use clap::{Args, Parser, Subcommand};
use kvsnap::common::{format_bytes, shutdown_token, FileConfig, S3Options};
use kvsnap::ops::{self, SnapshotRequest};
use kvsnap::store::SnapshotLocation;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvsnap")]
#[command(about = "Snapshot tooling for the control-plane key-value store")]
#[command(version)]
struct Cli {
    /// Config file (TOML or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct NodeArgs {
    /// Node name (defaults to the hostname)
    #[arg(long, env = "NODE_NAME", default_value = "")]
    node_name: String,

    /// Data directory root
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Directory holding local snapshots
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args)]
struct S3Args {
    /// Also keep snapshots in an S3-compatible bucket
    #[arg(long = "s3")]
    enabled: bool,

    /// S3 endpoint
    #[arg(long = "s3-endpoint")]
    endpoint: Option<String>,

    /// CA bundle for the S3 endpoint
    #[arg(long = "s3-endpoint-ca")]
    endpoint_ca: Option<PathBuf>,

    /// Skip TLS verification of the S3 endpoint
    #[arg(long = "s3-skip-ssl-verify")]
    skip_verify: bool,

    /// S3 access key
    #[arg(long = "s3-access-key", env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: Option<String>,

    /// S3 secret key
    #[arg(long = "s3-secret-key", env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// S3 bucket
    #[arg(long = "s3-bucket")]
    bucket: Option<String>,

    /// S3 region
    #[arg(long = "s3-region")]
    region: Option<String>,

    /// Folder (key prefix) inside the bucket
    #[arg(long = "s3-folder")]
    folder: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a snapshot of the managed store
    Save {
        #[command(flatten)]
        node: NodeArgs,

        /// Snapshot name prefix
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        s3: S3Args,

        #[arg(hide = true)]
        args: Vec<String>,
    },

    /// Delete snapshots by name
    Delete {
        #[command(flatten)]
        node: NodeArgs,

        #[command(flatten)]
        s3: S3Args,

        /// Snapshot names
        names: Vec<String>,
    },

    /// List known snapshots
    Ls {
        #[command(flatten)]
        node: NodeArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load the file first so its log level can apply
    let file = FileConfig::load(cli.config.as_deref());
    let level = cli
        .log_level
        .clone()
        .or_else(|| file.as_ref().ok().and_then(|f| f.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    if let Err(e) = init_logging(&level) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let file = match file {
        Ok(file) => file,
        Err(e) => return report(e),
    };

    match run(cli.command, file).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(e),
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot initialize logging: {}", e))
}

fn report(e: kvsnap::Error) -> ExitCode {
    tracing::error!("{}", e);
    eprintln!("Error: {}", e);
    ExitCode::from(e.exit_code())
}

async fn run(command: Commands, file: FileConfig) -> kvsnap::Result<()> {
    match command {
        Commands::Save {
            node,
            name,
            s3,
            args,
        } => {
            let mut request = request(node, &file, args);
            request.snapshot_name = name.or(file.snapshot.name.clone());
            request.s3 = merge_s3(s3, file.s3);

            let report = ops::save(request, shutdown_token()).await?;
            println!("Snapshot {} saved to {}", report.name, report.path.display());
            println!("  Size: {}", format_bytes(report.size));
            println!("  Keys: {} (revision {})", report.keys, report.revision);
            if let Some(key) = report.s3_key {
                println!("  Uploaded as: {}", key);
            }
        }

        Commands::Delete { node, s3, names } => {
            let mut request = request(node, &file, names);
            request.s3 = merge_s3(s3, file.s3);

            let report = ops::delete(request, shutdown_token()).await?;
            for name in &report.removed {
                println!("Removed snapshot {}", name);
            }
        }

        Commands::Ls { node } => {
            let entries = ops::list(request(node, &file, Vec::new()))?;
            println!(
                "{:<48} {:<10} {:>10} {:<20} {}",
                "Name", "Location", "Size", "Created", "Status"
            );
            for entry in entries {
                let location = match &entry.location {
                    SnapshotLocation::Local { .. } => "local",
                    SnapshotLocation::S3 { .. } => "s3",
                };
                println!(
                    "{:<48} {:<10} {:>10} {:<20} {}",
                    entry.name,
                    location,
                    format_bytes(entry.size),
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.status
                );
            }
        }
    }

    Ok(())
}

/// CLI flags win over the config file
fn request(node: NodeArgs, file: &FileConfig, args: Vec<String>) -> SnapshotRequest {
    let node_name = if node.node_name.is_empty() {
        file.node_name.clone().unwrap_or_default()
    } else {
        node.node_name
    };

    SnapshotRequest {
        node_name,
        data_dir: node.data_dir.or_else(|| file.data_dir.clone()),
        snapshot_dir: node.dir.or_else(|| file.snapshot.dir.clone()),
        retention: file.snapshot.retention.unwrap_or(0),
        args,
        ..Default::default()
    }
}

fn merge_s3(cli: S3Args, file: S3Options) -> S3Options {
    S3Options {
        enabled: cli.enabled || file.enabled,
        endpoint: cli.endpoint.or(file.endpoint),
        endpoint_ca: cli.endpoint_ca.or(file.endpoint_ca),
        skip_verify: cli.skip_verify || file.skip_verify,
        access_key: cli.access_key.or(file.access_key),
        secret_key: cli.secret_key.or(file.secret_key),
        bucket: cli.bucket.or(file.bucket),
        region: cli.region.or(file.region),
        folder: cli.folder.or(file.folder),
    }
}
