//! Minimal HTTP CONNECT proxy front-end.
//!
//! Accepts `CONNECT host:port HTTP/1.1`, discards the remaining headers,
//! and hands `(host, port)` to the dispatcher. Non-CONNECT methods get
//! 405; rule rejections get 403; unreachable targets get 502. Block
//! drops the connection without a status line, mirroring the SOCKS
//! behavior.

use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use crate::{
    dispatch::{Dispatcher, Prepared},
    error::{ClientError, Result},
    session::TunnelDial,
};

/// Upper bound on the request head we are willing to buffer.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Accept loop for the HTTP CONNECT listener. Runs until the socket
/// fails.
pub async fn run_http_listener<D: TunnelDial>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<D>>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_connect(stream, dispatcher).await {
                tracing::debug!(%peer, error = %e, "CONNECT connection ended");
            }
        });
    }
}

/// Drive one CONNECT request from request line to splice.
///
/// The read half stays wrapped in its `BufReader` all the way into the
/// relay, so bytes a client pipelines immediately behind its request
/// head (a TLS ClientHello, typically) are not lost.
pub async fn handle_connect<D: TunnelDial>(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher<D>>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request_line = read_line_bounded(&mut reader).await?;
    let target = match parse_connect_line(&request_line) {
        Ok(target) => target,
        Err(e) => {
            let _ = write_half
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n")
                .await;
            return Err(e);
        },
    };

    // Discard headers up to the blank line.
    let mut consumed = request_line.len();
    loop {
        let line = read_line_bounded(&mut reader).await?;
        consumed += line.len();
        if consumed > MAX_HEAD_BYTES {
            return Err(ClientError::BadRequest("request head too large"));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let (host, port) = target;

    match dispatcher.prepare(&host, port).await {
        Ok(Prepared::Blocked { .. }) => Ok(()),
        Ok(Prepared::Rejected { .. }) => {
            write_half
                .write_all(b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n")
                .await?;
            Ok(())
        },
        Ok(Prepared::Direct(remote)) => {
            write_half.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
            dispatcher.run_direct(reader, write_half, remote).await;
            Ok(())
        },
        Ok(Prepared::Proxy(proxy)) => {
            write_half.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
            dispatcher.run_proxy(reader, write_half, proxy).await;
            Ok(())
        },
        Err(e) => {
            let _ = write_half
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                .await;
            Err(e)
        },
    }
}

async fn read_line_bounded(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .take(MAX_HEAD_BYTES as u64)
        .read_line(&mut line)
        .await
        .map_err(|_| ClientError::BadRequest("request head not valid UTF-8"))?;
    if n == 0 {
        return Err(ClientError::BadRequest("connection closed mid-request"));
    }
    Ok(line)
}

/// Parse `CONNECT host:port HTTP/1.x`.
fn parse_connect_line(line: &str) -> Result<(String, u16)> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(ClientError::BadRequest("empty request line"))?;
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(ClientError::BadRequest("method is not CONNECT"));
    }

    let authority = parts.next().ok_or(ClientError::BadRequest("missing authority"))?;
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or(ClientError::BadRequest("unclosed IPv6 literal"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or(ClientError::BadRequest("missing port"))?
            .parse()
            .map_err(|_| ClientError::BadRequest("bad port"))?;
        (host.to_string(), port)
    } else {
        let (host, port) =
            authority.rsplit_once(':').ok_or(ClientError::BadRequest("missing port"))?;
        (
            host.to_string(),
            port.parse().map_err(|_| ClientError::BadRequest("bad port"))?,
        )
    };

    if host.is_empty() {
        return Err(ClientError::BadRequest("empty host"));
    }
    Ok((host, port))
}
