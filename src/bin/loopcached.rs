//! `loopcached` — the canonical LoopCache binary. Runs a master or data node
//! per a config file, or acts as a small administrative client against a
//! running cluster (spec §6).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loopcache::client::Client;
use loopcache::config::{parse_size, Configuration, Role as ConfigRole};
use loopcache::listener::{run_ram_sampler, run_registration_loop, serve, DataNodeState, Role};
use loopcache::master::MasterState;
use loopcache::node::canonical_name;
use loopcache::ring::Ring;
use loopcache::shutdown::ShutdownHandle;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "loopcached", about = "A distributed, in-memory, memcached-style object cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the crate's local unit test suite.
    Test,
    /// Run client-side integration checks against a running cluster.
    TestClient { endpoint: String },
    /// Run a master or data node per a config file.
    Server { config: PathBuf },
    /// Register a new data node with a running master.
    Add {
        master: String,
        node: String,
        max_bytes: String,
    },
    /// Remove a data node from a running master.
    Remove { master: String, node: String },
    /// Print the ring's current nodes.
    List { master: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {}", err);
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Test => run_local_tests(),
        Command::TestClient { endpoint } => run_client_checks(&endpoint).await,
        Command::Server { config } => run_server(&config).await,
        Command::Add {
            master,
            node,
            max_bytes,
        } => {
            let (master_host, master_port) = split_host_port(&master)?;
            let (node_host, node_port) = split_host_port(&node)?;
            let max_bytes = parse_size(&max_bytes)?;
            let client = Client::connect(master_host, master_port).await?;
            client.add_node(&node_host, node_port, max_bytes).await?;
            println!("added {}", canonical_name(&node_host, node_port));
            Ok(())
        }
        Command::Remove { master, node } => {
            let (master_host, master_port) = split_host_port(&master)?;
            let (node_host, node_port) = split_host_port(&node)?;
            let client = Client::connect(master_host, master_port).await?;
            client.remove_node(&node_host, node_port).await?;
            println!("removed {}", canonical_name(&node_host, node_port));
            Ok(())
        }
        Command::List { master } => {
            let (master_host, master_port) = split_host_port(&master)?;
            let client = Client::connect(master_host, master_port).await?;
            for node in client.nodes() {
                println!(
                    "{}\tmaxBytes={}\tstatus={}",
                    node.canonical_name(),
                    node.max_bytes,
                    node.status
                );
            }
            Ok(())
        }
    }
}

fn split_host_port(token: &str) -> Result<(String, i32)> {
    let (host, port) = token
        .rsplit_once(':')
        .with_context(|| format!("expected HOST:PORT, got `{}`", token))?;
    let port: i32 = port
        .parse()
        .with_context(|| format!("bad port in `{}`", token))?;
    Ok((host.to_string(), port))
}

/// `-test`: this delegates to `cargo test` rather than reimplementing a test
/// harness, since the crate's real unit and integration tests already live
/// under `#[cfg(test)]` and `tests/`.
fn run_local_tests() -> Result<()> {
    let status = std::process::Command::new(env!("CARGO"))
        .arg("test")
        .status()
        .context("failed to spawn `cargo test`")?;
    if !status.success() {
        bail!("test suite failed");
    }
    Ok(())
}

async fn run_client_checks(endpoint: &str) -> Result<()> {
    let (host, port) = split_host_port(endpoint)?;
    let client = Client::connect(host, port).await?;

    let key = format!("loopcache-testclient-{}", std::process::id());
    client.put(&key, b"ok").await.context("put failed")?;
    let value = client.get(&key).await.context("get failed")?;
    if value.as_deref() != Some(b"ok".as_slice()) {
        bail!("round-tripped value did not match what was written");
    }
    client.delete(&key).await.context("delete failed")?;
    if client.get(&key).await.context("get-after-delete failed")?.is_some() {
        bail!("key was still present after delete");
    }

    println!("client checks passed against {} node(s)", client.nodes().len());
    Ok(())
}

async fn run_server(config_path: &PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("reading config file {}", config_path.display()))?;
    let config = Configuration::parse(&text)?;
    let listener_addr = config
        .listener
        .as_ref()
        .context("config file has no Listener line")?
        .addr;

    let tcp_listener = TcpListener::bind(listener_addr)
        .await
        .with_context(|| format!("binding listener {}", listener_addr))?;

    let (shutdown_handle, shutdown) = ShutdownHandle::new();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_handle.trigger();
    });

    match config.role {
        ConfigRole::Master => run_as_master(config, config_path.clone(), tcp_listener, shutdown).await,
        ConfigRole::Data => run_as_data_node(config, listener_addr, tcp_listener, shutdown).await,
    }
}

async fn run_as_master(
    config: Configuration,
    config_path: PathBuf,
    tcp_listener: TcpListener,
    shutdown: loopcache::shutdown::Shutdown,
) -> Result<()> {
    let nodes = config.configured_nodes();
    let ring = Ring::from_nodes(nodes).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let state = MasterState::new(ring, config, Some(config_path));
    tracing::info!(addr = %tcp_listener.local_addr()?, "master listening");
    serve(tcp_listener, Role::Master(state), shutdown).await;
    Ok(())
}

async fn run_as_data_node(
    config: Configuration,
    listener_addr: SocketAddr,
    tcp_listener: TcpListener,
    shutdown: loopcache::shutdown::Shutdown,
) -> Result<()> {
    let self_name = canonical_name(&listener_addr.ip().to_string(), listener_addr.port() as i32);
    let state = DataNodeState::new(
        0,
        self_name,
        config.master_host.clone(),
        config.master_port,
        listener_addr.port() as i32,
    );

    let ram_sampler = tokio::spawn(run_ram_sampler(Arc::clone(&state), shutdown.clone()));
    let registration = tokio::spawn(run_registration_loop(Arc::clone(&state), shutdown.clone()));

    tracing::info!(addr = %tcp_listener.local_addr()?, "data node listening");
    serve(tcp_listener, Role::Data(state), shutdown).await;

    ram_sampler.abort();
    registration.abort();
    Ok(())
}
