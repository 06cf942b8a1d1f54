//! Recursing DNS filter bound to UDP/53. Allowed names are forwarded
//! verbatim to the upstream resolver over an ephemeral socket; everything
//! else is answered with a synthesized NXDOMAIN. The receive loop survives
//! socket errors and parse failures are dropped without a reply.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::config::DnsFilterConfig;
use common::dns;
use common::error::{ErrorCode, ProctorError};
use common::platform::Platform;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 4096;

pub struct DnsFilterHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    stopped_cache_service: bool,
}

impl DnsFilterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True when starting the filter required stopping the host DNS-cache
    /// service; the exit sequence restarts it in that case.
    pub fn stopped_cache_service(&self) -> bool {
        self.stopped_cache_service
    }

    pub async fn stop(self) {
        let _send_result = self.stop.send(true);
        let _join_result = self.task.await;
    }
}

struct FilterShared {
    socket: UdpSocket,
    upstream: SocketAddr,
    forward_timeout: Duration,
    allow_domains: Vec<String>,
}

/// Binds the filter socket and starts the receive loop. A bind conflict on
/// the DNS port is resolved by stopping the host DNS-cache service once
/// and retrying; any further failure is fatal to the enter sequence.
#[allow(clippy::missing_errors_doc)]
pub async fn start(
    cfg: &DnsFilterConfig,
    platform: &Arc<dyn Platform>,
    service_stop_wait: Duration,
) -> Result<DnsFilterHandle, ProctorError> {
    let bind_addr: SocketAddr = cfg.bind_addr.parse().map_err(|e| ProctorError::DnsError {
        message: format!("解析 dns.bind_addr 失败: {e}"),
        code: Some(ErrorCode::Dns201),
    })?;
    let upstream: SocketAddr = cfg.upstream.parse().map_err(|e| ProctorError::DnsError {
        message: format!("解析 dns.upstream 失败: {e}"),
        code: Some(ErrorCode::Dns201),
    })?;

    let mut stopped_cache_service = false;
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::warn!(
                service = %cfg.cache_service,
                "DNS port busy, stopping host DNS-cache service"
            );
            stopped_cache_service = platform
                .stop_service(&cfg.cache_service, service_stop_wait)
                .unwrap_or(false);
            match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    if stopped_cache_service {
                        let _restart_result =
                            platform.start_service(&cfg.cache_service, service_stop_wait);
                    }
                    return Err(ProctorError::DnsError {
                        message: format!(
                            "绑定 {bind_addr} 失败（已停止 {}）: {e}",
                            cfg.cache_service
                        ),
                        code: Some(ErrorCode::Dns201),
                    });
                }
            }
        }
        Err(e) => {
            return Err(ProctorError::DnsError {
                message: format!("绑定 {bind_addr} 失败: {e}"),
                code: Some(ErrorCode::Dns201),
            });
        }
    };

    let local_addr = socket.local_addr().map_err(ProctorError::IoError)?;
    let shared = Arc::new(FilterShared {
        socket,
        upstream,
        forward_timeout: Duration::from_millis(cfg.forward_timeout_ms),
        allow_domains: cfg.allow_domains.clone(),
    });

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let loop_shared = Arc::clone(&shared);
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = loop_shared.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let query = buf[..len].to_vec();
                            let shared = Arc::clone(&loop_shared);
                            tokio::spawn(async move {
                                handle_query(&shared, query, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "DNS receive failed");
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("DNS filter stopped");
    });

    tracing::info!(addr = %local_addr, "DNS filter listening");
    Ok(DnsFilterHandle {
        stop: stop_tx,
        task,
        local_addr,
        stopped_cache_service,
    })
}

async fn handle_query(shared: &FilterShared, query: Vec<u8>, peer: SocketAddr) {
    let name = match dns::parse_question_name(&query) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(peer = %peer, error = ?e, "unparseable query dropped");
            return;
        }
    };

    if dns::is_allowed(&name, &shared.allow_domains) {
        match forward_upstream(shared, &query).await {
            Ok(answer) => {
                if let Err(e) = shared.socket.send_to(&answer, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "relay send failed");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "upstream forward failed");
            }
        }
    } else {
        tracing::debug!(name = %name, "query refused");
    }

    let Some(response) = dns::synthesize_nxdomain(&query) else {
        return;
    };
    if let Err(e) = shared.socket.send_to(&response, peer).await {
        tracing::debug!(peer = %peer, error = %e, "NXDOMAIN send failed");
    }
}

/// Relays the original datagram to the upstream resolver on a fresh
/// ephemeral socket so in-flight queries never interfere.
async fn forward_upstream(shared: &FilterShared, query: &[u8]) -> Result<Vec<u8>, ProctorError> {
    let upstream_socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(ProctorError::IoError)?;
    upstream_socket
        .send_to(query, shared.upstream)
        .await
        .map_err(ProctorError::IoError)?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let received = tokio::time::timeout(shared.forward_timeout, upstream_socket.recv(&mut buf))
        .await
        .map_err(|_| ProctorError::DnsError {
            message: format!("上游 {} 超时", shared.upstream),
            code: Some(ErrorCode::Dns202),
        })?
        .map_err(ProctorError::IoError)?;
    buf.truncate(received);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    use common::platform::ServiceStatus;
    use common::platform::fake::FakePlatform;

    fn encode_query(id: u16, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x00]);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            out.push(u8::try_from(label.len()).unwrap_or(0));
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out
    }

    fn test_cfg(bind: &str, upstream: SocketAddr) -> DnsFilterConfig {
        DnsFilterConfig {
            bind_addr: bind.to_string(),
            upstream: upstream.to_string(),
            forward_timeout_ms: 500,
            allow_domains: vec!["codeforces.com".to_string()],
            cache_service: "Dnscache".to_string(),
        }
    }

    /// Minimal canned upstream: answers every query with its bytes plus a
    /// recognizable tail so relays can be asserted verbatim.
    async fn spawn_fake_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = socket.local_addr().expect("upstream addr");
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let mut answer = buf[..len].to_vec();
                answer[2] = 0x81;
                answer[3] = 0x80;
                answer.extend_from_slice(b"ANSWER");
                let _ = socket.send_to(&answer, peer).await;
            }
        });
        addr
    }

    async fn query_filter(filter_addr: SocketAddr, query: &[u8]) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        client.send_to(query, filter_addr).await.expect("send");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn allowed_query_is_relayed_verbatim() {
        let upstream = spawn_fake_upstream().await;
        let platform: Arc<dyn Platform> = Arc::new(FakePlatform::new());
        let handle = start(
            &test_cfg("127.0.0.1:0", upstream),
            &platform,
            Duration::from_secs(1),
        )
        .await
        .expect("filter starts");

        let query = encode_query(0x4242, "www.codeforces.com");
        let reply = query_filter(handle.local_addr(), &query).await;
        assert_eq!(&reply[..2], &0x4242u16.to_be_bytes());
        assert_eq!(reply[3], 0x80);
        assert!(reply.ends_with(b"ANSWER"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn refused_query_gets_nxdomain() {
        let upstream = spawn_fake_upstream().await;
        let platform: Arc<dyn Platform> = Arc::new(FakePlatform::new());
        let handle = start(
            &test_cfg("127.0.0.1:0", upstream),
            &platform,
            Duration::from_secs(1),
        )
        .await
        .expect("filter starts");

        let query = encode_query(0xBEEF, "evil.example.com");
        let reply = query_filter(handle.local_addr(), &query).await;
        assert_eq!(&reply[..2], &0xBEEFu16.to_be_bytes());
        assert_eq!(reply[3], 0x83);
        assert_eq!(&reply[dns::HEADER_LEN..], &query[dns::HEADER_LEN..]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn upstream_timeout_degrades_to_nxdomain() {
        // An upstream that never answers.
        let dead = UdpSocket::bind("127.0.0.1:0").await.expect("bind dead");
        let dead_addr = dead.local_addr().expect("dead addr");
        let platform: Arc<dyn Platform> = Arc::new(FakePlatform::new());
        let handle = start(
            &test_cfg("127.0.0.1:0", dead_addr),
            &platform,
            Duration::from_secs(1),
        )
        .await
        .expect("filter starts");

        let query = encode_query(0x0101, "codeforces.com");
        let reply = query_filter(handle.local_addr(), &query).await;
        assert_eq!(reply[3], 0x83);
        handle.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_stops_cache_service_and_retries() {
        let holder = UdpSocket::bind("127.0.0.1:0").await.expect("bind holder");
        let held = holder.local_addr().expect("held addr");
        let fake = Arc::new(FakePlatform::new());
        fake.set_service("Dnscache", ServiceStatus::Running);
        let platform: Arc<dyn Platform> = Arc::clone(&fake) as Arc<dyn Platform>;

        let upstream: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let result = start(
            &test_cfg(&held.to_string(), upstream),
            &platform,
            Duration::from_secs(1),
        )
        .await;

        // The retry fails too because the test still holds the port: the
        // DNS-cache service must have been stopped for the retry and then
        // restarted once the retry failed.
        assert!(result.is_err());
        assert_eq!(fake.stopped_services(), vec!["Dnscache".to_string()]);
        assert_eq!(fake.started_services(), vec!["Dnscache".to_string()]);
    }
}
