use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use node_attach::config::EngineConfig;
use node_attach::metrics;
use node_attach::{AttachEngine, Executor, PublishInfo};

#[derive(Parser, Debug)]
#[command(name = "node-attach")]
#[command(about = "Attach and detach iSCSI volumes on a Linux host")]
struct Args {
    /// Engine configuration file (JSON); flags below override it
    #[arg(long, env = "NODE_ATTACH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Prefix for sysfs and /dev when running inside a container
    #[arg(long, env = "HOST_ROOT", global = true)]
    host_root: Option<PathBuf>,

    /// Running as a Docker volume plugin (host mounted at /host)
    #[arg(long, env = "DOCKER_PLUGIN_MODE", global = true)]
    docker_plugin_mode: bool,

    /// Port used for portals given without one
    #[arg(long, env = "ISCSI_PORT", global = true)]
    iscsi_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Write Prometheus metrics to this node-exporter textfile on exit
    /// If not set, metrics are not collected
    #[arg(long, env = "METRICS_TEXTFILE", global = true)]
    metrics_textfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a LUN, formatting and mounting it as requested
    Attach {
        /// Publish info JSON file
        #[arg(long)]
        publish_info: PathBuf,
        /// Mount the filesystem here
        #[arg(long)]
        mount: Option<String>,
    },
    /// Mount an NFS export
    AttachNfs {
        #[arg(long)]
        publish_info: PathBuf,
        #[arg(long)]
        mount: String,
    },
    /// Remove a LUN's devices, by mount path or by target and LUN
    Detach {
        /// Device mounted at this path
        #[arg(long, conflicts_with_all = ["target_iqn", "lun"])]
        mount: Option<String>,
        /// Unmount the path first
        #[arg(long, requires = "mount")]
        unmount: bool,
        /// Delete the mount point afterwards
        #[arg(long, requires = "unmount")]
        remove_mount_point: bool,
        #[arg(long, requires = "lun")]
        target_iqn: Option<String>,
        #[arg(long, requires = "target_iqn")]
        lun: Option<u32>,
    },
    /// Grow the filesystem of an attached volume
    Expand {
        #[arg(long)]
        publish_info: PathBuf,
        #[arg(long)]
        staging_path: String,
    },
    /// Rescan a grown LUN until every path reports at least the minimum size
    Rescan {
        #[arg(long)]
        target_iqn: String,
        #[arg(long)]
        lun: u32,
        /// Minimum size in bytes
        #[arg(long)]
        min_size: u64,
    },
    /// Log in to a portal's target unless a session already exists
    EnsureSession {
        #[arg(long)]
        portal: String,
    },
    /// Log out of a target portal and delete its node records
    Logout {
        #[arg(long)]
        target_iqn: String,
        #[arg(long)]
        portal: String,
    },
    /// List attached iSCSI devices
    Devices {
        /// Only devices mounted as persistent volumes
        #[arg(long)]
        mounted: bool,
    },
    /// Print the initiator names configured on this host
    InitiatorIqns,
    /// List mounted filesystems and their sources
    Df,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level; stdout carries the result
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let metrics_handle = match args.metrics_textfile {
        Some(_) => Some(
            metrics::init_metrics()
                .map_err(|e| format!("Failed to initialize metrics: {}", e))?,
        ),
        None => None,
    };

    let config = load_config(&args).await?;
    info!(
        host_root = %config.host_root.display(),
        iscsi_port = config.iscsi_port,
        "Starting node-attach"
    );

    let engine = AttachEngine::new(config, Executor::system());
    let result = run(&engine, args.command).await;

    if let (Some(handle), Some(path)) = (&metrics_handle, &args.metrics_textfile)
        && let Err(e) = metrics::write_textfile(handle, path)
    {
        error!(path = %path.display(), error = %e, "Failed to write metrics textfile");
    }

    let output = result.map_err(|e| {
        error!(error = %e, "Command failed");
        e
    })?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn load_config(args: &Args) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path).await?,
        None => EngineConfig::default(),
    };

    if args.host_root.is_some() || args.docker_plugin_mode {
        config.host_root =
            EngineConfig::resolve_host_root(args.host_root.clone(), args.docker_plugin_mode);
    }
    if let Some(port) = args.iscsi_port {
        config.iscsi_port = port;
    }
    config.validate()?;
    Ok(config)
}

async fn read_publish_info(path: &Path) -> Result<PublishInfo, Box<dyn std::error::Error>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read publish info {}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Publish info as printed back to the caller, without CHAP secrets.
fn redacted(mut publish_info: PublishInfo) -> PublishInfo {
    publish_info.chap_initiator_secret.clear();
    publish_info.chap_target_secret.clear();
    publish_info
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    Ok(serde_json::to_value(value)?)
}

async fn run(
    engine: &AttachEngine,
    command: Command,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    match command {
        Command::Attach {
            publish_info,
            mount,
        } => {
            let mut publish_info = read_publish_info(&publish_info).await?;
            engine.attach(&mut publish_info, mount.as_deref()).await?;
            to_json(&redacted(publish_info))
        }
        Command::AttachNfs {
            publish_info,
            mount,
        } => {
            let publish_info = read_publish_info(&publish_info).await?;
            engine.attach_nfs(&publish_info, &mount).await?;
            Ok(json!({ "mountPoint": mount }))
        }
        Command::Detach {
            mount,
            unmount,
            remove_mount_point,
            target_iqn,
            lun,
        } => match (mount, target_iqn, lun) {
            (Some(mount), _, _) => {
                engine.detach_mount_path(&mount, unmount).await?;
                if remove_mount_point {
                    engine.mounts().delete_resource(Path::new(&mount)).await?;
                }
                Ok(json!({ "detached": mount }))
            }
            (None, Some(target_iqn), Some(lun)) => {
                engine.detach_lun(lun, &target_iqn).await?;
                Ok(json!({ "targetIqn": target_iqn, "lun": lun }))
            }
            _ => Err("detach needs --mount or both --target-iqn and --lun".into()),
        },
        Command::Expand {
            publish_info,
            staging_path,
        } => {
            let publish_info = read_publish_info(&publish_info).await?;
            let expansion = engine
                .expand_filesystem(&publish_info, &staging_path)
                .await?;
            to_json(&expansion)
        }
        Command::Rescan {
            target_iqn,
            lun,
            min_size,
        } => {
            engine.rescan_devices(&target_iqn, lun, min_size).await?;
            Ok(json!({ "targetIqn": target_iqn, "lun": lun, "minSize": min_size }))
        }
        Command::EnsureSession { portal } => {
            engine.sessions().ensure_session(&portal).await?;
            to_json(&engine.sessions().sessions().await?)
        }
        Command::Logout { target_iqn, portal } => {
            engine.logout(&target_iqn, &portal).await?;
            Ok(json!({ "targetIqn": target_iqn, "portal": portal }))
        }
        Command::Devices { mounted } => {
            let devices = if mounted {
                engine.mounted_iscsi_devices().await?
            } else {
                engine.iscsi_devices().await?
            };
            to_json(&devices)
        }
        Command::InitiatorIqns => to_json(&engine.sessions().initiator_iqns().await?),
        Command::Df => to_json(&engine.mounts().df_entries().await?),
    }
}
