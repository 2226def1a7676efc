//! Stream setup shared by the node transport and the worker client.

use std::time::Duration;

use fleet_core::protocol::{AuthResponse, channels};
use fleet_core::types::HostAndPort;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{TransportError, TransportResult};
use crate::packet::{Packet, PacketCodec};
use crate::tls::{TlsSettings, server_name};

/// A plain or TLS-wrapped byte stream.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// Dial `address`, wrapping the stream in TLS when configured.
pub(crate) async fn open_stream(
    address: &HostAndPort,
    tls: Option<&TlsSettings>,
    limit: Duration,
) -> TransportResult<BoxedIo> {
    let stream = timeout(
        limit,
        TcpStream::connect((address.host.as_str(), address.port)),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;

    Ok(match tls {
        Some(tls) => {
            let name = server_name(&address.host)?;
            let stream = timeout(limit, tls.connector.connect(name, stream))
                .await
                .map_err(|_| TransportError::Timeout)??;
            Box::new(stream)
        }
        None => Box::new(stream),
    })
}

/// Wrap an accepted stream in TLS when configured.
pub(crate) async fn accept_stream(
    stream: TcpStream,
    tls: Option<&TlsSettings>,
    limit: Duration,
) -> TransportResult<BoxedIo> {
    stream.set_nodelay(true)?;
    Ok(match tls {
        Some(tls) => {
            let stream = timeout(limit, tls.acceptor.accept(stream))
                .await
                .map_err(|_| TransportError::Timeout)??;
            Box::new(stream)
        }
        None => Box::new(stream),
    })
}

/// Read the first frame of a connection, which must be on the auth channel.
pub(crate) async fn read_auth_frame(io: &mut BoxedIo, limit: Duration) -> TransportResult<Packet> {
    let packet = timeout(limit, PacketCodec::read_frame(io))
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for auth".into()))??
        .ok_or_else(|| TransportError::Handshake("connection closed during auth".into()))?;
    if packet.channel != channels::AUTH {
        return Err(TransportError::Handshake(format!(
            "expected auth packet, got channel '{}'",
            packet.channel
        )));
    }
    Ok(packet)
}

/// Send an auth request and wait for the verdict.
pub(crate) async fn exchange_auth(
    io: &mut BoxedIo,
    request: &Packet,
    limit: Duration,
) -> TransportResult<AuthResponse> {
    PacketCodec::write_frame(io, request).await?;
    let response: AuthResponse = read_auth_frame(io, limit).await?.decode()?;
    if !response.accepted {
        return Err(TransportError::Handshake("rejected by remote node".into()));
    }
    Ok(response)
}
