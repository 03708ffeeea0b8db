//! The master role (C7): authoritative ring, registration, membership
//! changes, and background config fan-out.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::fs;

use crate::config::Configuration;
use crate::connection;
use crate::node::{canonical_name, Node, NodeStatus};
use crate::ring::Ring;
use crate::wire::{encode_ring, put_string, RequestKind, Reader, ResponseKind};

/// How many times the master retries a `ChangeConfig` push to one peer
/// before giving up and marking that peer `Questionable` (spec §4.6).
const FANOUT_RETRIES: u32 = 3;

pub struct MasterState {
    pub ring: RwLock<Ring>,
    pub config: RwLock<Configuration>,
    pub config_path: Option<PathBuf>,
}

impl MasterState {
    pub fn new(ring: Ring, config: Configuration, config_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(MasterState {
            ring: RwLock::new(ring),
            config: RwLock::new(config),
            config_path,
        })
    }

    fn snapshot_nodes(&self) -> Vec<Node> {
        self.ring.read().nodes().cloned().collect()
    }

    /// Rewrites the config file, regenerating `Node` lines from the current
    /// ring while preserving every other line (spec §6, §9).
    async fn persist(&self) {
        let Some(path) = &self.config_path else {
            return;
        };

        let rendered = {
            let config = self.config.read();
            let nodes = self.snapshot_nodes();
            config.render(&nodes)
        };

        if let Err(err) = fs::write(path, rendered).await {
            tracing::error!(error = %err, path = %path.display(), "failed to persist config file");
        }
    }

    /// Pushes the current minimal ring to every node other than `exclude`,
    /// in parallel, with no acknowledgement horizon (spec §4.6, §9): a push
    /// that fails against one node never blocks or rolls back the others.
    async fn fan_out_config(&self, exclude: Option<&str>) {
        let targets: Vec<Node> = self
            .snapshot_nodes()
            .into_iter()
            .filter(|n| Some(n.canonical_name().as_str()) != exclude)
            .collect();

        let mut payload = BytesMut::new();
        {
            let ring = self.ring.read();
            let nodes: Vec<Node> = ring.nodes().cloned().collect();
            encode_ring(&mut payload, &nodes, false);
        }
        let payload = payload.freeze();

        let pushes = targets.into_iter().map(|target| {
            let payload = payload.clone();
            async move {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let result = connection::request(
                        &target.host,
                        target.port,
                        RequestKind::ChangeConfig.to_u8(),
                        &payload,
                    )
                    .await;

                    match result {
                        Ok(_) => return String::new(),
                        Err(err) if attempt < FANOUT_RETRIES => {
                            tracing::debug!(
                                node = %target.canonical_name(),
                                attempt,
                                error = %err,
                                "config push failed, retrying"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                node = %target.canonical_name(),
                                error = %err,
                                "config push exhausted retries, marking node questionable"
                            );
                            return target.canonical_name();
                        }
                    }
                }
            }
        });

        let failures: Vec<String> = join_all(pushes)
            .await
            .into_iter()
            .filter(|s: &String| !s.is_empty())
            .collect();

        if !failures.is_empty() {
            let mut ring = self.ring.write();
            for name in failures {
                ring.mark_questionable(&name);
            }
        }
    }
}

/// Dispatches one master-role request, returning the wire response kind and
/// its payload.
pub async fn handle_request(
    state: &Arc<MasterState>,
    kind: RequestKind,
    payload: &[u8],
    peer_ip: IpAddr,
) -> (ResponseKind, Vec<u8>) {
    match kind {
        RequestKind::GetConfig => handle_get_config(state),
        RequestKind::Register => handle_register(state, payload, peer_ip).await,
        RequestKind::NodeUnreachable => handle_node_unreachable(state, payload).await,
        RequestKind::AddNode => handle_add_node(state, payload).await,
        RequestKind::RemoveNode => handle_remove_node(state, payload).await,
        RequestKind::ChangeNode => handle_change_node(state, payload).await,
        RequestKind::Clear => handle_clear(state).await,
        RequestKind::Ping => (ResponseKind::Accepted, Vec::new()),
        // Data-node-only kinds asked of the master.
        RequestKind::GetObject
        | RequestKind::PutObject
        | RequestKind::DeleteObject
        | RequestKind::GetStats
        | RequestKind::ChangeConfig
        | RequestKind::FireSale => (ResponseKind::NotDataNode, Vec::new()),
    }
}

fn handle_get_config(state: &Arc<MasterState>) -> (ResponseKind, Vec<u8>) {
    let ring = state.ring.read();
    let nodes: Vec<Node> = ring.nodes().cloned().collect();
    let mut payload = BytesMut::new();
    encode_ring(&mut payload, &nodes, true);
    (ResponseKind::Configuration, payload.to_vec())
}

async fn handle_register(
    state: &Arc<MasterState>,
    payload: &[u8],
    peer_ip: IpAddr,
) -> (ResponseKind, Vec<u8>) {
    let mut r = Reader::new(payload);
    let Ok(listener_port) = r.read_i32() else {
        return (ResponseKind::InternalServerError, Vec::new());
    };

    let name = canonical_name(&peer_ip.to_string(), listener_port);
    let found = {
        let mut ring = state.ring.write();
        if ring.set_status(&name, NodeStatus::Up) {
            Some(ring.nodes().cloned().collect::<Vec<Node>>())
        } else {
            None
        }
    };

    match found {
        None => (ResponseKind::UnknownNode, Vec::new()),
        Some(nodes) => {
            tracing::info!(node = %name, "data node registered");
            let mut out = BytesMut::new();
            encode_ring(&mut out, &nodes, false);
            (ResponseKind::Configuration, out.to_vec())
        }
    }
}

async fn handle_node_unreachable(
    state: &Arc<MasterState>,
    payload: &[u8],
) -> (ResponseKind, Vec<u8>) {
    let mut r = Reader::new(payload);
    let (Ok(host), Ok(port)) = (r.read_string(), r.read_i32()) else {
        return (ResponseKind::InternalServerError, Vec::new());
    };

    let reachable = connection::request(&host, port, RequestKind::Ping.to_u8(), &[])
        .await
        .is_ok();

    // Open question retained verbatim from the reference implementation
    // (spec §9): a peer that *does* answer gets `NodeExists`, which client
    // retry loops treat identically to "ok, try again" -- never `Accepted`.
    if reachable {
        (ResponseKind::NodeExists, Vec::new())
    } else {
        let name = canonical_name(&host, port);
        state.ring.write().mark_questionable(&name);
        tracing::warn!(node = %name, "marked questionable after unreachable report");
        (ResponseKind::Accepted, Vec::new())
    }
}

async fn handle_add_node(state: &Arc<MasterState>, payload: &[u8]) -> (ResponseKind, Vec<u8>) {
    let mut r = Reader::new(payload);
    let parsed = (
        r.read_string(),
        r.read_i32(),
        r.read_i64(),
        r.read_u8(),
        r.read_u8(),
    );
    let (Ok(host), Ok(port), Ok(max_bytes), ..) = parsed else {
        return (ResponseKind::InternalServerError, Vec::new());
    };

    let name = canonical_name(&host, port);
    if state.ring.read().contains(&name) {
        return (ResponseKind::NodeExists, Vec::new());
    }

    let ping = connection::request(&host, port, RequestKind::Ping.to_u8(), &[]).await;
    let ping_ok = matches!(
        ping.map(|f| f.kind),
        Ok(k) if k == ResponseKind::Accepted.to_u8() || k == ResponseKind::DataNodeNotReady.to_u8()
    );
    if !ping_ok {
        return (ResponseKind::InternalServerError, Vec::new());
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let mut node = Node::new(host, port, max_bytes);
        node.status = NodeStatus::Up;
        let added = state.ring.write().add_node(node);
        match added {
            Ok(true) => {
                state.persist().await;
                state.fan_out_config(None).await;
            }
            Ok(false) => {
                tracing::warn!("AddNode background task found the node already present");
            }
            Err(err) => {
                tracing::error!(error = %err, "fatal: placement collision while adding node");
                std::process::exit(1);
            }
        }
    });

    (ResponseKind::Accepted, Vec::new())
}

async fn handle_remove_node(state: &Arc<MasterState>, payload: &[u8]) -> (ResponseKind, Vec<u8>) {
    let mut r = Reader::new(payload);
    let (Ok(host), Ok(port)) = (r.read_string(), r.read_i32()) else {
        return (ResponseKind::InternalServerError, Vec::new());
    };
    let name = canonical_name(&host, port);

    if !state.ring.read().contains(&name) {
        return (ResponseKind::UnknownNode, Vec::new());
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        match state.ring.write().remove_node(&name) {
            Ok(true) => {
                state.persist().await;
                // The departing node isn't a fan-out target any more.
                state.fan_out_config(Some(name.as_str())).await;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(error = %err, "fatal: placement collision while removing node");
                std::process::exit(1);
            }
        }
    });

    // Unlike the reference implementation's inverted `!Accepted` success
    // signal (a documented bug, spec §9 Open Questions), this port returns
    // `Accepted` on success.
    (ResponseKind::Accepted, Vec::new())
}

async fn handle_change_node(state: &Arc<MasterState>, payload: &[u8]) -> (ResponseKind, Vec<u8>) {
    let mut r = Reader::new(payload);
    let parsed = (r.read_string(), r.read_i32(), r.read_i64());
    let (Ok(host), Ok(port), Ok(max_bytes)) = parsed else {
        return (ResponseKind::InternalServerError, Vec::new());
    };
    let name = canonical_name(&host, port);

    if max_bytes <= 0 {
        // No dedicated `InvalidConfiguration` wire kind exists (spec §6's
        // fixed 15-value response table); this maps to the generic server
        // fault code, per DESIGN.md.
        return (ResponseKind::InternalServerError, Vec::new());
    }

    if !state.ring.read().contains(&name) {
        return (ResponseKind::UnknownNode, Vec::new());
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        match state.ring.write().change_node_capacity(&name, max_bytes) {
            Ok(true) => {
                state.persist().await;
                state.fan_out_config(None).await;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(error = %err, "fatal: placement collision while changing node capacity");
                std::process::exit(1);
            }
        }
    });

    (ResponseKind::Accepted, Vec::new())
}

async fn handle_clear(state: &Arc<MasterState>) -> (ResponseKind, Vec<u8>) {
    let targets = state.snapshot_nodes();
    let pushes = targets.into_iter().map(|target| async move {
        let _ = connection::request(&target.host, target.port, RequestKind::FireSale.to_u8(), &[]).await;
    });
    join_all(pushes).await;
    (ResponseKind::Accepted, Vec::new())
}

/// Encodes an `AddNode`/`ChangeNode` request payload (spec §6).
pub fn encode_add_or_change_node(host: &str, port: i32, max_bytes: i64) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, host);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&max_bytes.to_be_bytes());
    buf.extend_from_slice(&[0u8, 0u8]); // status + reserved, unused by the server
    buf.to_vec()
}

/// Encodes a `RemoveNode`/`NodeUnreachable` request payload (spec §6).
pub fn encode_host_port(host: &str, port: i32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, host);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.to_vec()
}
