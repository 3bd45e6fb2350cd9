//! Plumbing between local TCP sockets and tunnel streams.

use std::io;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::connection::{ConnectError, Connection};
use crate::stream::ChannelStream;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Client side: every socket accepted on `listener` gets its own stream,
/// labeled with the socket's peer address. Returns once the connection
/// closes.
pub async fn serve_local(listener: TcpListener, connection: Connection) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    tracing::info!(
        target = "rtc_tunnel::relay",
        local_addr = %local_addr,
        remote_id = %connection.remote_id(),
        "accepting local connections"
    );
    loop {
        let (socket, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = connection.closed() => break,
        };
        let connection = connection.clone();
        tokio::spawn(async move {
            let label = peer_addr.to_string();
            match connection.create_stream(&label).await {
                Ok(stream) => pipe(socket, stream).await,
                Err(err) => tracing::warn!(
                    target = "rtc_tunnel::relay",
                    label = %label,
                    error = %err,
                    "failed to open stream"
                ),
            }
        });
    }
    tracing::info!(target = "rtc_tunnel::relay", "tunnel closed; no longer accepting");
    Ok(())
}

/// Server side: every stream the remote opens is connected to `target`.
/// Returns once the connection closes.
pub async fn forward_streams(connection: Connection, target: String) -> Result<(), RelayError> {
    tracing::info!(
        target = "rtc_tunnel::relay",
        remote_id = %connection.remote_id(),
        forward = %target,
        "forwarding streams"
    );
    while let Some(stream) = connection.accept_stream().await {
        let target = target.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(socket) => pipe(socket, stream).await,
                Err(err) => {
                    tracing::warn!(
                        target = "rtc_tunnel::relay",
                        label = %stream.label(),
                        forward = %target,
                        error = %err,
                        "failed to reach forward target"
                    );
                    let _ = stream.close().await;
                }
            }
        });
    }
    Ok(())
}

async fn pipe(mut socket: TcpStream, mut stream: ChannelStream) {
    let label = stream.label().to_string();
    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((sent, received)) => tracing::debug!(
            target = "rtc_tunnel::relay",
            label = %label,
            sent,
            received,
            "relay finished"
        ),
        Err(err) => tracing::debug!(
            target = "rtc_tunnel::relay",
            label = %label,
            error = %err,
            "relay ended with error"
        ),
    }
    let _ = stream.shutdown().await;
    let _ = socket.shutdown().await;
}
