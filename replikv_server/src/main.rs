//! RepliKV replica node executable.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use replikv::{pf_error, serve_http, RepliKvError, ReplicaActor, Role};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Role of this node: 'primary' or 'backup'.
    #[arg(short, long)]
    role: String,

    /// Key-value HTTP API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Internal port used for replica-replica messages.
    #[arg(short, long, default_value_t = 52800)]
    p2p_port: u16,

    /// Address of the primary's internal port (required for backups).
    /// Example: '--primary 127.0.0.1:52800'.
    #[arg(long)]
    primary: Option<SocketAddr>,

    /// Replica configuration TOML string.
    /// Example: --config 'expected_backups = 2'.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(role)` on success or
    /// `Err(RepliKvError)` on any error.
    fn sanitize(&self) -> Result<Role, RepliKvError> {
        let role = match self.role.to_lowercase().as_str() {
            "primary" => Role::Primary,
            "backup" => Role::Backup,
            _ => {
                return Err(RepliKvError(format!(
                    "role '{}' unrecognized",
                    self.role
                )))
            }
        };

        if self.api_port <= 1024 {
            Err(RepliKvError(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.p2p_port <= 1024 {
            Err(RepliKvError(format!(
                "invalid p2p_port {}",
                self.p2p_port
            )))
        } else if self.api_port == self.p2p_port {
            Err(RepliKvError(format!(
                "api_port == p2p_port {}",
                self.api_port
            )))
        } else if role == Role::Backup && self.primary.is_none() {
            Err(RepliKvError(
                "backup requires the --primary address".into(),
            ))
        } else if self.threads < 2 {
            Err(RepliKvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(role)
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), RepliKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let role = args.sanitize()?;

    // parse internal communication port
    let p2p_addr: SocketAddr = format!("127.0.0.1:{}", args.p2p_port)
        .parse()
        .map_err(|e| {
            RepliKvError(format!(
                "failed to parse p2p_addr: port {}: {}",
                args.p2p_port, e
            ))
        })?;

    // parse key-value HTTP API port
    let api_addr: SocketAddr = format!("127.0.0.1:{}", args.api_port)
        .parse()
        .map_err(|e| {
            RepliKvError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-{}", role.name().to_lowercase()))
        .build()?;

    // enter tokio runtime, set up the replica and its HTTP front-end, and
    // start the main event loop logic
    runtime.block_on(async move {
        let (mut actor, handle) = ReplicaActor::new_and_setup(
            role,
            p2p_addr,
            args.primary,
            args.config.as_deref(),
        )
        .await?;

        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx_term.send(true);
            }
        });

        let http_handle =
            tokio::spawn(serve_http(handle, api_addr, rx_term.clone()));

        actor.run(rx_term).await?;
        http_handle.abort();

        Ok::<(), RepliKvError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
        std::process::exit(1);
    }
}
