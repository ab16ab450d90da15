//! Minimal SOCKS5 server front-end (RFC 1928, CONNECT only, no auth).
//!
//! Thin by design: the parser extracts `(host, port)` and everything
//! interesting happens in the dispatcher. Rule actions map onto the wire
//! as: Block → drop without a reply, Reject → reply 0x02 (connection not
//! allowed), dial failures → 0x04/0x05, unsupported commands → 0x07.

use std::{net::IpAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    dispatch::{Dispatcher, Prepared},
    error::{ClientError, Result},
    session::TunnelDial,
};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_UNSUPPORTED: u8 = 0x07;

/// Accept loop for the SOCKS5 listener. Runs until the socket fails.
pub async fn run_socks_listener<D: TunnelDial>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<D>>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_socks(stream, dispatcher).await {
                tracing::debug!(%peer, error = %e, "SOCKS connection ended");
            }
        });
    }
}

/// Drive one SOCKS5 connection from greeting to splice.
pub async fn handle_socks<D: TunnelDial>(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher<D>>,
) -> Result<()> {
    let (host, port) = match negotiate(&mut stream).await? {
        Some(target) => target,
        None => return Ok(()), // refusal already written
    };

    match dispatcher.prepare(&host, port).await {
        Ok(Prepared::Blocked { .. }) => {
            // Silent refusal: no reply bytes at all.
            Ok(())
        },
        Ok(Prepared::Rejected { .. }) => {
            write_reply(&mut stream, REP_NOT_ALLOWED).await?;
            Ok(())
        },
        Ok(Prepared::Direct(remote)) => {
            write_reply(&mut stream, REP_SUCCESS).await?;
            let (local_read, local_write) = stream.into_split();
            dispatcher.run_direct(local_read, local_write, remote).await;
            Ok(())
        },
        Ok(Prepared::Proxy(proxy)) => {
            write_reply(&mut stream, REP_SUCCESS).await?;
            let (local_read, local_write) = stream.into_split();
            dispatcher.run_proxy(local_read, local_write, proxy).await;
            Ok(())
        },
        Err(e) => {
            let rep = match &e {
                ClientError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                    REP_CONNECTION_REFUSED
                },
                ClientError::Io(_) => REP_HOST_UNREACHABLE,
                ClientError::Transport(_) => REP_HOST_UNREACHABLE,
                _ => REP_GENERAL_FAILURE,
            };
            let _ = write_reply(&mut stream, rep).await;
            Err(e)
        },
    }
}

/// Method negotiation plus request parsing. Returns `None` when a
/// refusal reply was already sent.
async fn negotiate(stream: &mut TcpStream) -> Result<Option<(String, u16)>> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ClientError::BadRequest("not a SOCKS5 greeting"));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
        return Ok(None);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ...
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ClientError::BadRequest("bad request version"));
    }
    if request[1] != CMD_CONNECT {
        write_reply(stream, REP_COMMAND_UNSUPPORTED).await?;
        return Ok(None);
    }

    let host = match request[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        },
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(ClientError::BadRequest("empty domain"));
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| ClientError::BadRequest("domain not valid UTF-8"))?
        },
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets).to_string()
        },
        _ => return Err(ClientError::BadRequest("unknown address type")),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some((host, u16::from_be_bytes(port))))
}

/// Standard reply with a zeroed IPv4 bind address.
async fn write_reply(stream: &mut TcpStream, rep: u8) -> Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use aether_core::{EventBus, Metrics, RuleAction, RuleEngine};

    use super::*;
    use crate::session::{SessionManager, SessionOptions, testing::MemoryDial};

    async fn socks_setup(
        default_action: RuleAction,
    ) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>)
    {
        let (dialer, _sessions, peers) = MemoryDial::new();
        let bus = EventBus::new();
        let manager = SessionManager::new(dialer, SessionOptions::new("psk"), bus, Metrics::new());
        manager.start().await.unwrap();
        let dispatcher = Dispatcher::new(
            manager,
            Arc::new(RuleEngine::new(Vec::new(), default_action)),
            16 * 1024,
            0,
            None,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_socks_listener(listener, dispatcher));
        (addr, peers)
    }

    async fn socks_connect(addr: std::net::SocketAddr, host: &str, port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn connect_reaches_the_tunnel() {
        let (addr, mut peers) = socks_setup(RuleAction::Proxy).await;

        let mut stream = socks_connect(addr, "example.com", 80).await;
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_SUCCESS);

        // A tunnel stream was opened for the request.
        assert!(peers.recv().await.is_some());
    }

    #[tokio::test]
    async fn reject_action_replies_not_allowed() {
        let (addr, mut peers) = socks_setup(RuleAction::Reject).await;

        let mut stream = socks_connect(addr, "example.com", 80).await;
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_NOT_ALLOWED);
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn block_action_drops_without_reply() {
        let (addr, mut peers) = socks_setup(RuleAction::Block).await;

        let mut stream = socks_connect(addr, "blocked.example", 80).await;
        // Connection closes with no reply bytes.
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_methods_without_no_auth_are_refused() {
        let (addr, _peers) = socks_setup(RuleAction::Proxy).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Offer only GSSAPI.
        stream.write_all(&[0x05, 0x01, 0x01]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn non_connect_commands_are_unsupported() {
        let (addr, _peers) = socks_setup(RuleAction::Proxy).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();

        // BIND request.
        stream
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut rep = [0u8; 10];
        stream.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[1], REP_COMMAND_UNSUPPORTED);
    }
}
