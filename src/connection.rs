//! A thin TCP dialer shared by the client role, the master's config fan-out,
//! and a data node's registration loop.
//!
//! Every connection in LoopCache is short-lived and carries exactly one
//! request/response exchange before it closes (spec §4.4), so this is far
//! simpler than a pooled or multiplexed connection type: it's just "connect,
//! try each DNS candidate in turn, set `TCP_NODELAY`", the same strategy
//! this crate's ancestry uses for its single long-lived memcached
//! connection.

use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::Error;
use crate::wire::{read_frame, write_frame, Frame};

/// Resolves `host:port`, trying each candidate address until one connects.
pub async fn dial(host: &str, port: i32) -> Result<TcpStream, Error> {
    if let Ok(addr) = format!("{}:{}", host, port).parse::<SocketAddr>() {
        return dial_addr(addr).await;
    }

    let lookup = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = lookup_host(lookup).await?.collect();

    let mut last_err = None;
    for addr in addrs {
        match dial_addr(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("could not resolve {}:{}", host, port),
        ))
    }))
}

pub async fn dial_addr(addr: SocketAddr) -> Result<TcpStream, Error> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_nodelay(true)?;
    Ok(socket.connect(addr).await?)
}

/// Sends a single request frame and waits for the single response frame
/// that answers it, then lets the connection drop -- the whole point of
/// this type being "short-lived and not multiplexed" (spec §4.4).
pub async fn request(host: &str, port: i32, kind: u8, payload: &[u8]) -> Result<Frame, Error> {
    let mut stream = dial(host, port).await?;
    write_frame(&mut stream, kind, payload).await?;
    Ok(read_frame(&mut stream).await?)
}
