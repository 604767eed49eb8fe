//! `kubectl-mount`: mount a remote directory of a running pod's container
//! as a local read-only FUSE filesystem.
//!
//! The target container only needs `stat`, `ls`, `readlink` and `cat` on its
//! PATH; no agent is installed.

mod adapter;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use adapter::PodMountFs;
use podmount_core::PodFs;
use podmount_exec::{ClusterArgs, ExecTarget, PodClient, PodExecutor};

#[derive(Parser, Debug)]
#[command(
    name = "kubectl-mount",
    about = "Mount a remote filesystem of a pod's container",
    after_help = "Examples:
  # Mount /etc of the default container on the pod nginx
  kubectl-mount nginx:/etc /tmp/nginx/etc

  # Mount /etc of the side-car container on the pod nginx
  kubectl-mount -c sidecar nginx:/etc /tmp/sidecar/etc"
)]
struct Args {
    /// Remote filesystem as [USER@]POD:[REMOTE_DIR]
    remote: String,

    /// Local mount point (an existing empty directory)
    mountpoint: PathBuf,

    /// Container name. If omitted, the kubectl.kubernetes.io/default-container
    /// annotation selects the container, else the first container is used
    #[arg(short = 'c', long = "container")]
    container: Option<String>,

    /// Print FUSE debug log
    #[arg(long)]
    debug: bool,

    #[command(flatten)]
    cluster: ClusterArgs,
}

#[derive(Debug, PartialEq, Eq)]
struct RemoteSpec {
    user: Option<String>,
    pod: String,
    dir: String,
}

/// Parses `[USER@]POD:[REMOTE_DIR]`. An empty directory portion means the
/// container's working directory.
fn parse_remote(remote: &str) -> Result<RemoteSpec> {
    let usage = "expected '[USER@]POD:[REMOTE_DIR]'";
    let Some((target, dir)) = remote.split_once(':') else {
        bail!("{usage}: the remote filesystem should contain ':'");
    };

    let (user, pod) = match target.split_once('@') {
        Some((user, pod)) => {
            if user.is_empty() {
                bail!("{usage}: the remote user name is empty");
            }
            (Some(user.to_string()), pod)
        }
        None => (None, target),
    };
    if pod.is_empty() {
        bail!("{usage}: the pod name is empty");
    }

    Ok(RemoteSpec {
        user,
        pod: pod.to_string(),
        dir: if dir.is_empty() {
            ".".to_string()
        } else {
            dir.to_string()
        },
    })
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let spec = parse_remote(&args.remote)?;
    if let Some(user) = &spec.user {
        // The exec subresource always runs as the container's configured
        // user; the USER@ portion is accepted for compatibility only.
        debug!(user, "remote user ignored; exec runs as the container user");
    }

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let config = Arc::new(
        args.cluster
            .resolve()
            .context("loading cluster configuration")?,
    );

    let client = PodClient::new(&config).context("building cluster client")?;
    let pod = runtime
        .block_on(client.get_pod(&config.namespace, &spec.pod))
        .with_context(|| format!("looking up pod {}", spec.pod))?;
    pod.ensure_running()?;
    let container = pod.select_container(args.container.as_deref())?;
    info!(
        namespace = %config.namespace,
        pod = %spec.pod,
        container = %container,
        dir = %spec.dir,
        "resolved mount target"
    );

    let target = ExecTarget {
        namespace: config.namespace.clone(),
        pod: spec.pod.clone(),
        container,
    };
    let executor = PodExecutor::new(runtime.handle().clone(), config, target);
    let fsys = PodFs::new(Arc::new(executor), spec.dir.clone());

    // Fail fast before mounting: the remote directory must exist and be a
    // directory.
    let cancel = CancellationToken::new();
    let root = fsys
        .stat(&cancel, ".")
        .with_context(|| format!("cannot stat remote directory {}", spec.dir))?;
    if !root.is_dir() {
        bail!("remote path {} is not a directory", spec.dir);
    }

    let options = vec![
        MountOption::RO,
        MountOption::FSName(format!("podmount:{}", spec.pod)),
        MountOption::Subtype("podmount".to_string()),
    ];
    let fs = PodMountFs::new(fsys, cancel.clone());
    let session = fuser::spawn_mount2(fs, &args.mountpoint, &options)
        .with_context(|| format!("mounting on {}", args.mountpoint.display()))?;
    eprintln!(
        "Mounted {}:{} on {}",
        spec.pod,
        spec.dir,
        args.mountpoint.display()
    );

    runtime
        .block_on(async {
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigquit = signal(SignalKind::quit())?;
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, unmounting"),
                _ = sigterm.recv() => info!("received SIGTERM, unmounting"),
                _ = sigquit.recv() => info!("received SIGQUIT, unmounting"),
            }
            Ok::<_, std::io::Error>(())
        })
        .context("installing signal handlers")?;

    cancel.cancel();
    session.join();
    info!("unmounted {}", args.mountpoint.display());
    Ok(())
}
