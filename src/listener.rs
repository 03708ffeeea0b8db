//! The TCP accept loop and per-connection dispatch table (C6).
//!
//! One listener binary runs in one of two roles. Both share the same framing
//! and the same "read one request, dispatch, write one response, close"
//! connection lifecycle (spec §4.4); what differs is the dispatch table and
//! the background tasks each role starts alongside the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::{TcpListener, TcpStream};

use crate::connection;
use crate::master::MasterState;
use crate::node::{Node, NodeStatus};
use crate::ring::Ring;
use crate::shutdown::Shutdown;
use crate::store::{sample_process_rss_bytes, Store};
use crate::wire::{decode_ring, encode_ring, read_frame, write_frame, RequestKind, ResponseKind};

/// How often a data node samples its own RSS to re-derive the RAM multiplier
/// (spec §4.5).
const RAM_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// How long a data node waits between failed `Register` attempts.
const REGISTER_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// State for the data-node role: the local store plus whatever ring view it
/// has absorbed from the master's `ChangeConfig` pushes.
pub struct DataNodeState {
    pub store: Store,
    pub ring: parking_lot::RwLock<Ring>,
    pub self_name: String,
    pub master_host: String,
    pub master_port: i32,
    pub listener_port: i32,
    ready: parking_lot::RwLock<bool>,
}

impl DataNodeState {
    pub fn new(
        max_bytes: i64,
        self_name: String,
        master_host: String,
        master_port: i32,
        listener_port: i32,
    ) -> Arc<Self> {
        Arc::new(DataNodeState {
            store: Store::new(max_bytes),
            ring: parking_lot::RwLock::new(Ring::new()),
            self_name,
            master_host,
            master_port,
            listener_port,
            ready: parking_lot::RwLock::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.read()
    }

    fn mark_ready(&self) {
        *self.ready.write() = true;
    }
}

/// What a listener was configured to be. `bin/loopcached.rs` picks one of
/// these at startup based on the config file's `Master`/`Node` lines.
pub enum Role {
    Master(Arc<MasterState>),
    Data(Arc<DataNodeState>),
}

/// Runs the accept loop until shutdown is triggered, spawning one task per
/// connection.
pub async fn serve(listener: TcpListener, role: Role, mut shutdown: Shutdown) {
    let role = Arc::new(role);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let role = Arc::clone(&role);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, &role).await {
                        tracing::debug!(peer = %peer, error = %err, "connection closed with error");
                    }
                });
            }
            _ = shutdown.wait() => {
                tracing::info!("shutdown triggered, no longer accepting connections");
                return;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    role: &Role,
) -> Result<(), crate::error::Error> {
    let frame = read_frame(&mut stream).await?;

    let (response_kind, payload) = match RequestKind::from_u8(frame.kind) {
        None => (ResponseKind::InvalidRequestType, Vec::new()),
        Some(kind) => dispatch(role, kind, &frame.payload, peer.ip()).await,
    };

    write_frame(&mut stream, response_kind.to_u8(), &payload).await?;
    Ok(())
}

async fn dispatch(
    role: &Role,
    kind: RequestKind,
    payload: &[u8],
    peer_ip: std::net::IpAddr,
) -> (ResponseKind, Vec<u8>) {
    match role {
        Role::Master(state) => crate::master::handle_request(state, kind, payload, peer_ip).await,
        Role::Data(state) => {
            if !state.is_ready() && !matches!(kind, RequestKind::Ping | RequestKind::ChangeConfig) {
                return (ResponseKind::DataNodeNotReady, Vec::new());
            }
            handle_data_request(state, kind, payload).await
        }
    }
}

/// Dispatches one data-node-role request.
async fn handle_data_request(
    state: &Arc<DataNodeState>,
    kind: RequestKind,
    payload: &[u8],
) -> (ResponseKind, Vec<u8>) {
    match kind {
        RequestKind::GetObject => {
            let key = String::from_utf8_lossy(payload).into_owned();
            if let Some(reconfigure) = reconfigure_if_not_owner(state, &key).await {
                return reconfigure;
            }
            match state.store.get(&key) {
                Some(value) => (ResponseKind::ObjectOk, value),
                None => (ResponseKind::ObjectMissing, Vec::new()),
            }
        }
        RequestKind::PutObject => {
            let mut r = crate::wire::Reader::new(payload);
            let (Ok(key), Ok(value)) = (r.read_bytes(), r.read_bytes()) else {
                return (ResponseKind::ReadKeyError, Vec::new());
            };
            let Ok(key) = String::from_utf8(key) else {
                return (ResponseKind::ReadKeyError, Vec::new());
            };
            if let Some(reconfigure) = reconfigure_if_not_owner(state, &key).await {
                return reconfigure;
            }
            let put_time = crate::store::now_millis();
            state.store.put(&key, value, put_time);
            (ResponseKind::ObjectOk, Vec::new())
        }
        RequestKind::DeleteObject => {
            let key = String::from_utf8_lossy(payload).into_owned();
            if let Some(reconfigure) = reconfigure_if_not_owner(state, &key).await {
                return reconfigure;
            }
            state.store.delete(&key);
            (ResponseKind::ObjectOk, Vec::new())
        }
        RequestKind::GetStats => {
            let stats = state.store.stats();
            (ResponseKind::ObjectOk, stats.encode())
        }
        RequestKind::ChangeConfig => {
            let mut r = crate::wire::Reader::new(payload);
            let nodes = match decode_ring(&mut r) {
                Ok(nodes) => nodes,
                Err(_) => return (ResponseKind::ReadDataError, Vec::new()),
            };

            let placed = {
                let mut ring = state.ring.write();
                ring.replace_nodes(nodes)
            };
            if let Err(err) = placed {
                tracing::error!(error = %err, "fatal: placement collision absorbing pushed ring");
                std::process::exit(1);
            }

            state.mark_ready();
            absorb_self_membership(state);

            let state = Arc::clone(state);
            tokio::spawn(async move {
                let ring = state.ring.read().clone();
                crate::store::rebalance(&state.store, &ring, &state.self_name).await;
            });

            (ResponseKind::Accepted, Vec::new())
        }
        RequestKind::FireSale => {
            state.store.clear();
            (ResponseKind::Accepted, Vec::new())
        }
        RequestKind::Ping => (ResponseKind::Accepted, Vec::new()),
        // Master-only kinds asked of a data node.
        RequestKind::GetConfig
        | RequestKind::NodeUnreachable
        | RequestKind::AddNode
        | RequestKind::RemoveNode
        | RequestKind::ChangeNode
        | RequestKind::Register
        | RequestKind::Clear => (ResponseKind::NotMasterNode, Vec::new()),
    }
}

/// If this node's current ring view says someone else owns `key`, first
/// re-registers with the master to pick up a fresher ring and re-checks
/// ownership against it before giving up (spec §4.5 "Ownership redirect with
/// self-correction"): membership can have shifted between the last
/// `ChangeConfig` push and this request landing. If the refreshed ring says
/// this node owns the key after all, a background rebalance is kicked off
/// and the request is served locally instead of redirected. Only when the
/// refreshed ring still says someone else owns it does this return a
/// `ReConfigure` response carrying the full ring so the client can retry
/// against the rightful owner (spec §4.7).
async fn reconfigure_if_not_owner(
    state: &Arc<DataNodeState>,
    key: &str,
) -> Option<(ResponseKind, Vec<u8>)> {
    if owns_key(state, key) {
        return None;
    }

    if register_once(state).await && owns_key(state, key) {
        let rebalance_state = Arc::clone(state);
        tokio::spawn(async move {
            let ring = rebalance_state.ring.read().clone();
            crate::store::rebalance(&rebalance_state.store, &ring, &rebalance_state.self_name).await;
        });
        return None;
    }

    let nodes: Vec<Node> = state.ring.read().nodes().cloned().collect();
    let mut buf = BytesMut::new();
    encode_ring(&mut buf, &nodes, true);
    Some((ResponseKind::ReConfigure, buf.to_vec()))
}

fn owns_key(state: &Arc<DataNodeState>, key: &str) -> bool {
    matches!(
        state.ring.read().owner_for_key(key),
        Some(owner) if owner.canonical_name() == state.self_name
    )
}

/// Sets this node's status from its own entry in the currently-absorbed ring
/// (spec §4.6): `Up` (and its store capacity synced) when present, `Migrating`
/// when the node has been dropped from the ring it just absorbed.
fn absorb_self_membership(state: &Arc<DataNodeState>) {
    match state.ring.read().get(&state.self_name) {
        Some(node) => {
            state.store.set_max_bytes(node.max_bytes);
            *state.store.status.write() = NodeStatus::Up;
        }
        None => {
            *state.store.status.write() = NodeStatus::Migrating;
        }
    }
}

/// Sends one `Register` request to the master and, on a `Configuration`
/// response, absorbs the returned ring. Returns whether registration
/// succeeded. Shared by the startup registration loop and the
/// self-correcting ownership redirect path.
async fn register_once(state: &Arc<DataNodeState>) -> bool {
    let mut payload = BytesMut::new();
    payload.put_i32(state.listener_port);
    let payload = payload.freeze();

    let result = connection::request(
        &state.master_host,
        state.master_port,
        RequestKind::Register.to_u8(),
        &payload,
    )
    .await;

    match result {
        Ok(frame) if frame.kind == ResponseKind::Configuration.to_u8() => {
            let mut r = crate::wire::Reader::new(&frame.payload);
            match decode_ring(&mut r) {
                Ok(nodes) => {
                    let placed = state.ring.write().replace_nodes(nodes);
                    if let Err(err) = placed {
                        tracing::error!(error = %err, "fatal: placement collision absorbing register response");
                        std::process::exit(1);
                    }
                    state.mark_ready();
                    absorb_self_membership(state);
                    tracing::info!("registered with master");
                    true
                }
                Err(err) => {
                    tracing::warn!(error = %err, "malformed ring in register response");
                    false
                }
            }
        }
        Ok(frame) => {
            tracing::warn!(response = frame.kind, "register rejected by master");
            false
        }
        Err(err) => {
            tracing::debug!(error = %err, "master unreachable for register");
            false
        }
    }
}

/// Repeatedly attempts to `Register` with the master until it succeeds.
/// Runs for the lifetime of the process alongside `serve` (spec §4.4's
/// data-node startup sequence).
pub async fn run_registration_loop(state: Arc<DataNodeState>, mut shutdown: Shutdown) {
    loop {
        if shutdown.is_triggered() {
            return;
        }

        if register_once(&state).await {
            return;
        }

        if !shutdown.sleep(REGISTER_RETRY_INTERVAL).await {
            return;
        }
    }
}

/// Periodically samples this process's RSS and feeds it to the store so the
/// RAM multiplier used for eviction stays current (spec §4.5).
pub async fn run_ram_sampler(state: Arc<DataNodeState>, mut shutdown: Shutdown) {
    loop {
        if !shutdown.sleep(RAM_SAMPLE_INTERVAL).await {
            return;
        }
        state.store.record_ram_sample(sample_process_rss_bytes());
    }
}
