//! Stream dispatch: inbound connection → rule action → tunnel stream.
//!
//! The listeners (SOCKS5, HTTP CONNECT) parse their wire formats and hand
//! this module a bare `(host, port)`. The dispatcher evaluates the rule
//! engine and either refuses the inbound, splices a direct TCP
//! connection, or opens a tunnel stream: primary session, fresh nonce,
//! sealed Metadata record, then the shared bidirectional relay.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use aether_core::{
    CoalescePolicy, CoreError, EventKind, PerfSink, RuleAction, RuleEngine, RouteRequest,
    relay_bidirectional,
};
use aether_proto::MetadataPayload;
use tokio::net::TcpStream;

use crate::{
    error::{ClientError, Result},
    session::{OpenedStream, SessionManager, TunnelDial, TunnelSession},
};

/// TCP dial ceiling for Direct actions.
const DIRECT_DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// What the dispatcher decided for one inbound connection.
pub enum Prepared<S: TunnelSession> {
    /// Drop the inbound without any reply.
    Blocked {
        /// Rule that fired.
        rule_id: Option<String>,
    },
    /// Refuse the inbound with a protocol-level rejection.
    Rejected {
        /// Rule that fired.
        rule_id: Option<String>,
    },
    /// Raw TCP connection to the target, ready to splice.
    Direct(TcpStream),
    /// Tunnel stream with the Metadata handshake already sent.
    Proxy(ProxyStream<S>),
}

/// An opened tunnel stream awaiting its local peer.
pub struct ProxyStream<S: TunnelSession> {
    /// Dispatcher-assigned stream id (events, logs).
    pub stream_id: u64,
    /// `host:port` of the destination.
    pub target: String,
    opened: OpenedStream<S>,
}

/// Bridges local listeners to the session pool.
pub struct Dispatcher<D: TunnelDial> {
    manager: Arc<SessionManager<D>>,
    rules: Arc<RuleEngine>,
    max_record_payload: usize,
    announce_max_padding: u16,
    next_stream_id: AtomicU64,
    perf: Option<PerfSink>,
}

impl<D: TunnelDial> Dispatcher<D> {
    /// Build a dispatcher over a session manager and rule engine.
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager<D>>,
        rules: Arc<RuleEngine>,
        max_record_payload: usize,
        announce_max_padding: u16,
        perf: Option<PerfSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            rules,
            max_record_payload,
            announce_max_padding,
            next_stream_id: AtomicU64::new(1),
            perf,
        })
    }

    /// Session manager backing this dispatcher.
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager<D>> {
        &self.manager
    }

    /// Evaluate rules and prepare the selected action for `(host, port)`.
    pub async fn prepare(self: &Arc<Self>, host: &str, port: u16) -> Result<Prepared<D::Session>> {
        let ip = host.parse().ok();
        let request = RouteRequest { domain: ip.is_none().then_some(host), ip, port };
        let decision = self.rules.match_request(&request);

        match decision.action {
            RuleAction::Block => {
                tracing::debug!(host, port, rule = ?decision.rule_id, "blocked by rule");
                Ok(Prepared::Blocked { rule_id: decision.rule_id })
            },
            RuleAction::Reject => {
                tracing::debug!(host, port, rule = ?decision.rule_id, "rejected by rule");
                Ok(Prepared::Rejected { rule_id: decision.rule_id })
            },
            RuleAction::Direct => {
                let remote =
                    tokio::time::timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect((host, port)))
                        .await
                        .map_err(|_| {
                            ClientError::Transport(format!("direct dial to {host}:{port} timed out"))
                        })??;
                Ok(Prepared::Direct(remote))
            },
            RuleAction::Proxy => self.open_proxy(host, port).await.map(Prepared::Proxy),
        }
    }

    async fn open_proxy(self: &Arc<Self>, host: &str, port: u16) -> Result<ProxyStream<D::Session>> {
        let mut opened = self.manager.open_stream().await?;

        let mut metadata = MetadataPayload::for_host(host, port).map_err(CoreError::Protocol)?;
        if self.announce_max_padding > 0 {
            metadata.max_padding = Some(self.announce_max_padding);
        }

        if let Err(e) = opened.sender.send_metadata(&metadata).await {
            if matches!(
                e,
                CoreError::Crypto(aether_crypto::CryptoError::CounterExhausted)
            ) {
                // Rekey in the background; this inbound fails fast.
                let manager = Arc::clone(&self.manager);
                tokio::spawn(async move {
                    if let Err(e) = manager.rotate_now().await {
                        tracing::warn!("exhaustion-triggered rotation failed: {e}");
                    }
                });
            }
            return Err(e.into());
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let target = format!("{host}:{port}");

        self.manager.metrics().stream_opened();
        self.manager
            .bus()
            .publish(EventKind::StreamOpened { stream_id, target: target.clone() });

        Ok(ProxyStream { stream_id, target, opened })
    }

    /// Pump an inbound connection through its prepared tunnel stream
    /// until both directions finish.
    ///
    /// Takes the local halves separately so listeners can hand over a
    /// buffered reader without losing bytes the client pipelined behind
    /// its request.
    pub async fn run_proxy<LR, LW>(
        self: &Arc<Self>,
        local_read: LR,
        local_write: LW,
        proxy: ProxyStream<D::Session>,
    ) where
        LR: tokio::io::AsyncRead + Unpin + Send,
        LW: tokio::io::AsyncWrite + Unpin + Send,
    {
        let ProxyStream { stream_id, target, opened } = proxy;

        let outcome = relay_bidirectional(
            local_read,
            local_write,
            opened.sender,
            opened.receiver,
            CoalescePolicy::new(self.max_record_payload),
            Arc::clone(self.manager.metrics()),
            self.perf.clone(),
        )
        .await;

        self.manager.metrics().stream_closed();

        if let Some(error) = &outcome.error {
            tracing::debug!(stream_id, target, %error, "stream failed");
            self.manager.bus().publish(EventKind::StreamError {
                stream_id,
                code: error.code_str().to_string(),
            });
        }
        self.manager.bus().publish(EventKind::StreamClosed {
            stream_id,
            bytes_sent: outcome.bytes_up,
            bytes_received: outcome.bytes_down,
        });
    }

    /// Splice an inbound connection with a directly-dialed target.
    pub async fn run_direct<LR, LW>(self: &Arc<Self>, mut local_read: LR, mut local_write: LW, remote: TcpStream)
    where
        LR: tokio::io::AsyncRead + Unpin + Send,
        LW: tokio::io::AsyncWrite + Unpin + Send,
    {
        use tokio::io::AsyncWriteExt;

        let (mut remote_read, mut remote_write) = remote.into_split();
        let up = async {
            let result = tokio::io::copy(&mut local_read, &mut remote_write).await;
            let _ = remote_write.shutdown().await;
            result
        };
        let down = async {
            let result = tokio::io::copy(&mut remote_read, &mut local_write).await;
            let _ = local_write.shutdown().await;
            result
        };
        let (up_result, down_result) = tokio::join!(up, down);
        if let Err(e) = up_result.and(down_result) {
            tracing::debug!(error = %e, "direct splice ended with error");
        }
    }
}
