//! The cluster client (C8): ring-view caching, key routing, and the
//! transport-failure / redirect / not-ready retry state machine (spec §4.7).

use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;

use crate::connection;
use crate::error::Error;
use crate::master::{encode_add_or_change_node, encode_host_port};
use crate::node::Node;
use crate::ring::Ring;
use crate::store::StatsSnapshot;
use crate::wire::{decode_ring, put_bytes, Reader, RequestKind, ResponseKind};

/// Maximum attempts per logical operation before giving up with
/// `Error::RetriesExhausted` (spec §4.7).
const MAX_ATTEMPTS: u32 = 3;

/// How long the client backs off after a `DataNodeNotReady` response before
/// retrying the same node.
const NOT_READY_BACKOFF: Duration = Duration::from_millis(50);

pub struct Client {
    master_host: String,
    master_port: i32,
    ring: RwLock<Ring>,
}

impl Client {
    /// Connects to the master and caches its full ring view (with virtual
    /// positions) before returning (spec §4.7 "boots via `GetConfig`").
    pub async fn connect(master_host: impl Into<String>, master_port: i32) -> Result<Self, Error> {
        let master_host = master_host.into();
        let ring = fetch_config(&master_host, master_port).await?;
        Ok(Client {
            master_host,
            master_port,
            ring: RwLock::new(ring),
        })
    }

    fn owner_for(&self, key: &str) -> Option<Node> {
        self.ring.read().owner_for_key(key).cloned()
    }

    async fn refresh_config(&self) -> Result<(), Error> {
        let ring = fetch_config(&self.master_host, self.master_port).await?;
        *self.ring.write() = ring;
        Ok(())
    }

    /// Runs one data-node request against the key's owner, following the
    /// retry/redirect state machine: a transport failure reports the node
    /// unreachable to the master then refreshes the ring and retries; a
    /// `ReConfigure` response installs the attached ring and retries;
    /// `DataNodeNotReady` sleeps briefly and retries. Gives up with
    /// [`Error::RetriesExhausted`] after `MAX_ATTEMPTS`.
    async fn data_request(&self, key: &str, kind: RequestKind, payload: &[u8]) -> Result<crate::wire::Frame, Error> {
        for attempt in 1..=MAX_ATTEMPTS {
            let Some(owner) = self.owner_for(key) else {
                self.refresh_config().await?;
                continue;
            };

            let result = connection::request(&owner.host, owner.port, kind.to_u8(), payload).await;

            match result {
                Ok(frame) if frame.kind == ResponseKind::ReConfigure.to_u8() => {
                    let mut r = Reader::new(&frame.payload);
                    if let Ok(nodes) = decode_ring(&mut r) {
                        if let Ok(ring) = Ring::from_nodes(nodes) {
                            *self.ring.write() = ring;
                        }
                    }
                    continue;
                }
                Ok(frame) if frame.kind == ResponseKind::DataNodeNotReady.to_u8() => {
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(NOT_READY_BACKOFF).await;
                    }
                    continue;
                }
                Ok(frame) => return Ok(frame),
                Err(_) => {
                    let _ = connection::request(
                        &self.master_host,
                        self.master_port,
                        RequestKind::NodeUnreachable.to_u8(),
                        &encode_host_port(&owner.host, owner.port),
                    )
                    .await;
                    self.refresh_config().await?;
                }
            }
        }

        Err(Error::RetriesExhausted)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let frame = self.data_request(key, RequestKind::GetObject, key.as_bytes()).await?;
        match ResponseKind::from_u8(frame.kind) {
            Some(ResponseKind::ObjectOk) => Ok(Some(frame.payload)),
            Some(ResponseKind::ObjectMissing) => Ok(None),
            Some(other) => Err(Error::Response(other)),
            None => Err(Error::Wire(crate::error::WireError::UnknownKind(frame.kind))),
        }
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut payload = BytesMut::new();
        put_bytes(&mut payload, key.as_bytes());
        put_bytes(&mut payload, value);
        let frame = self.data_request(key, RequestKind::PutObject, &payload).await?;
        expect_object_ok(frame)
    }

    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let frame = self.data_request(key, RequestKind::DeleteObject, key.as_bytes()).await?;
        expect_object_ok(frame)
    }

    /// Queries a single data node's stats directly (spec §4.7 administrative
    /// call; not key-routed).
    pub async fn get_stats(&self, host: &str, port: i32) -> Result<StatsSnapshot, Error> {
        let frame = connection::request(host, port, RequestKind::GetStats.to_u8(), &[]).await?;
        if frame.kind != ResponseKind::ObjectOk.to_u8() {
            return Err(Error::Response(
                ResponseKind::from_u8(frame.kind).unwrap_or(ResponseKind::InternalServerError),
            ));
        }
        decode_stats(&frame.payload)
    }

    /// Clears every data node in the cluster (spec `FireSale`/`Clear`).
    pub async fn clear_cluster(&self) -> Result<(), Error> {
        let frame = connection::request(
            &self.master_host,
            self.master_port,
            RequestKind::Clear.to_u8(),
            &[],
        )
        .await?;
        expect_accepted(frame)
    }

    pub async fn add_node(&self, host: &str, port: i32, max_bytes: i64) -> Result<(), Error> {
        let payload = encode_add_or_change_node(host, port, max_bytes);
        let frame = connection::request(
            &self.master_host,
            self.master_port,
            RequestKind::AddNode.to_u8(),
            &payload,
        )
        .await?;
        expect_accepted(frame)
    }

    pub async fn change_node(&self, host: &str, port: i32, max_bytes: i64) -> Result<(), Error> {
        let payload = encode_add_or_change_node(host, port, max_bytes);
        let frame = connection::request(
            &self.master_host,
            self.master_port,
            RequestKind::ChangeNode.to_u8(),
            &payload,
        )
        .await?;
        expect_accepted(frame)
    }

    pub async fn remove_node(&self, host: &str, port: i32) -> Result<(), Error> {
        let payload = encode_host_port(host, port);
        let frame = connection::request(
            &self.master_host,
            self.master_port,
            RequestKind::RemoveNode.to_u8(),
            &payload,
        )
        .await?;
        expect_accepted(frame)
    }

    /// The cluster's node list as currently cached by this client.
    pub fn nodes(&self) -> Vec<Node> {
        self.ring.read().nodes().cloned().collect()
    }
}

async fn fetch_config(master_host: &str, master_port: i32) -> Result<Ring, Error> {
    let frame = connection::request(master_host, master_port, RequestKind::GetConfig.to_u8(), &[]).await?;
    if frame.kind != ResponseKind::Configuration.to_u8() {
        return Err(Error::Response(
            ResponseKind::from_u8(frame.kind).unwrap_or(ResponseKind::InternalServerError),
        ));
    }
    let mut r = Reader::new(&frame.payload);
    let nodes = decode_ring(&mut r)?;
    // The master sends locations, so placement is just replaying what it
    // already computed rather than re-deriving it independently.
    Ring::from_nodes(nodes).map_err(|err| Error::InvalidConfiguration(err.to_string()))
}

fn decode_stats(payload: &[u8]) -> Result<StatsSnapshot, Error> {
    let mut r = Reader::new(payload);
    let num_objects = r.read_i32()?;
    let total_data_bytes = r.read_i64()?;
    let latest_ram_bytes = r.read_i64()?;
    let multiplier_str = r.read_string()?;
    let max_bytes = r.read_i64()?;
    let status_byte = r.read_u8()?;
    let ram_multiplier: f64 = multiplier_str
        .parse()
        .map_err(|_| Error::Wire(crate::error::WireError::InvalidUtf8))?;
    let status = crate::node::NodeStatus::from_wire(status_byte)
        .ok_or(Error::Wire(crate::error::WireError::UnknownKind(status_byte)))?;

    Ok(StatsSnapshot {
        num_objects,
        total_data_bytes,
        latest_ram_bytes,
        ram_multiplier,
        max_bytes,
        status,
    })
}

fn expect_object_ok(frame: crate::wire::Frame) -> Result<(), Error> {
    match ResponseKind::from_u8(frame.kind) {
        Some(ResponseKind::ObjectOk) => Ok(()),
        Some(other) => Err(Error::Response(other)),
        None => Err(Error::Wire(crate::error::WireError::UnknownKind(frame.kind))),
    }
}

fn expect_accepted(frame: crate::wire::Frame) -> Result<(), Error> {
    match ResponseKind::from_u8(frame.kind) {
        Some(ResponseKind::Accepted) => Ok(()),
        Some(other) => Err(Error::Response(other)),
        None => Err(Error::Wire(crate::error::WireError::UnknownKind(frame.kind))),
    }
}
