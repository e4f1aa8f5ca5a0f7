//! Ephemeral port allocation inside a bounded range.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{constants, ProtocolError, Result};

/// Bind the first free port in `range`, probing from a random offset and
/// wrapping around.
pub async fn bind_in_range(host: IpAddr, range: RangeInclusive<u16>) -> Result<(TcpListener, u16)> {
    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return Err(ProtocolError::ConfigError(format!(
            "empty port range {start}-{end}"
        )));
    }

    let span = u32::from(end - start) + 1;
    let offset = rand::rng().random_range(0..span);

    for step in 0..span {
        let port = start + ((offset + step) % span) as u16;
        match TcpListener::bind(SocketAddr::new(host, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "Port in use, probing next");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ProtocolError::TransportError(
        constants::ERR_NO_FREE_PORT.to_string(),
    ))
}
