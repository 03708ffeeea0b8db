//! Integration tests exercising a real master plus several data nodes over
//! loopback TCP: basic object operations, cluster growth, unreachable-node
//! handling, and cluster-wide clear.

use std::time::Duration;

use loopcache::config::{Configuration, Role as ConfigRole};
use loopcache::listener::{run_ram_sampler, run_registration_loop, serve, DataNodeState, Role};
use loopcache::master::MasterState;
use loopcache::node::NodeStatus;
use loopcache::ring::Ring;
use loopcache::shutdown::ShutdownHandle;
use loopcache::Client;
use tokio::net::TcpListener;

/// Starts a bare master (no configured nodes) on an ephemeral loopback port.
/// The returned handle must be kept alive for the master to keep accepting
/// connections -- dropping it is what a real process does on shutdown.
async fn start_master() -> (String, i32, ShutdownHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Configuration {
        role: ConfigRole::Master,
        listener: None,
        master_host: String::new(),
        master_port: 0,
        trace: None,
        lines: Vec::new(),
    };
    let state = MasterState::new(Ring::new(), config, None);

    let (handle, shutdown) = ShutdownHandle::new();
    tokio::spawn(serve(listener, Role::Master(state), shutdown));

    ("127.0.0.1".to_string(), addr.port() as i32, handle)
}

/// Starts a data node listening on an ephemeral port and registers it with
/// `master` by first letting the master learn about it through `AddNode`,
/// then starting the registration loop so its first `Register` attempt
/// lands after the master already knows the name.
async fn start_data_node(master: &Client, master_host: &str, master_port: i32, max_bytes: i64) -> (String, i32, ShutdownHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let host = "127.0.0.1".to_string();
    let port = addr.port() as i32;

    let self_name = loopcache::node::canonical_name(&host, port);
    let state = DataNodeState::new(0, self_name, master_host.to_string(), master_port, port);

    let (handle, shutdown) = ShutdownHandle::new();
    tokio::spawn(serve(listener, Role::Data(state.clone()), shutdown.clone()));

    master
        .add_node(&host, port, max_bytes)
        .await
        .expect("AddNode should be accepted");
    // The master's background add+fan-out runs off the request path.
    tokio::time::sleep(Duration::from_millis(80)).await;

    tokio::spawn(run_registration_loop(state.clone(), shutdown.clone()));
    tokio::spawn(run_ram_sampler(state, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(80)).await;

    (host, port, handle)
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let (master_host, master_port, _master_handle) = start_master().await;
    let client = Client::connect(master_host.clone(), master_port).await.unwrap();

    let (_h1, _p1, _node1) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;
    let (_h2, _p2, _node2) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;

    // Refresh so the client's ring includes both nodes before routing keys.
    let client = Client::connect(master_host, master_port).await.unwrap();

    for i in 0..20 {
        let key = format!("round-trip-{i}");
        client.put(&key, b"hello world").await.unwrap();
    }
    for i in 0..20 {
        let key = format!("round-trip-{i}");
        assert_eq!(client.get(&key).await.unwrap(), Some(b"hello world".to_vec()));
    }
    for i in 0..20 {
        let key = format!("round-trip-{i}");
        client.delete(&key).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap(), None);
    }
}

#[tokio::test]
async fn added_node_is_visible_to_a_fresh_client_within_two_seconds() {
    let (master_host, master_port, _master_handle) = start_master().await;
    let client = Client::connect(master_host.clone(), master_port).await.unwrap();

    let (_h1, _p1, _node1) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;
    let (_h2, _p2, _node2) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let fresh = Client::connect(master_host.clone(), master_port).await.unwrap();
        if fresh.nodes().len() == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "nodes never converged to 2");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn unreachable_node_is_marked_questionable() {
    let (master_host, master_port, _master_handle) = start_master().await;
    let client = Client::connect(master_host.clone(), master_port).await.unwrap();

    let (host, port, node_handle) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;
    let (_h2, _p2, _node2) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;

    let client = Client::connect(master_host.clone(), master_port).await.unwrap();

    // Kill the data node's accept loop by triggering its own shutdown so the
    // port stops answering, then drive enough key traffic that at least one
    // request is routed to it and observes the transport failure.
    node_handle.trigger();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enough key traffic that at least one request routes to the downed node
    // and trips the client's unreachable-report-and-retry path. Whether any
    // individual call surfaces an error to the caller isn't the point here;
    // what matters is that the master ends up marking the node questionable.
    for i in 0..200 {
        let key = format!("unreachable-probe-{i}");
        let _ = client.put(&key, b"x").await;
    }
    let fresh = Client::connect(master_host, master_port).await.unwrap();
    let downed_name = loopcache::node::canonical_name(&host, port);
    let marked = fresh
        .nodes()
        .into_iter()
        .any(|n| n.canonical_name() == downed_name && n.status == NodeStatus::Questionable);
    assert!(marked, "downed node should have been marked questionable");
}

#[tokio::test]
async fn clear_cluster_empties_every_node() {
    let (master_host, master_port, _master_handle) = start_master().await;
    let client = Client::connect(master_host.clone(), master_port).await.unwrap();

    let (_h1, _p1, _node1) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;
    let (_h2, _p2, _node2) = start_data_node(&client, &master_host, master_port, 16 * 1024 * 1024).await;

    let client = Client::connect(master_host, master_port).await.unwrap();

    for i in 0..10 {
        client.put(&format!("clear-me-{i}"), b"data").await.unwrap();
    }

    client.clear_cluster().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..10 {
        assert_eq!(client.get(&format!("clear-me-{i}")).await.unwrap(), None);
    }
}
