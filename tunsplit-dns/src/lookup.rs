//! Lookup backends used by the hostname resolver
//!
//! [`SystemLookup`] goes through the operating system resolver. [`UpstreamLookup`]
//! talks plain DNS to explicit servers and supports the same upstream selection
//! strategies as a forwarding client would.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::prelude::IndexedRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::config::{DnsServerSpec, UpstreamStrategy};
use crate::error::{Error, Result};

/// Per-query timeout for a single upstream exchange
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP DNS response size
const MAX_TCP_RESPONSE_SIZE: usize = 65535;

/// Resolves one hostname to the set of addresses it currently maps to
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// Look up every A and AAAA address for `hostname`
    async fn lookup(&self, hostname: &str) -> Result<BTreeSet<IpAddr>>;

    /// Short description for log lines
    fn name(&self) -> String;
}

/// Lookup through the operating system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, hostname: &str) -> Result<BTreeSet<IpAddr>> {
        let addrs: BTreeSet<IpAddr> = tokio::net::lookup_host((hostname, 0))
            .await?
            .map(|sa| sa.ip())
            .collect();

        if addrs.is_empty() {
            return Err(Error::NoAddresses(hostname.to_string()));
        }
        Ok(addrs)
    }

    fn name(&self) -> String {
        "system".to_string()
    }
}

/// Lookup through explicit upstream DNS servers
pub struct UpstreamLookup {
    upstreams: Vec<DnsServerSpec>,
    strategy: UpstreamStrategy,
    next_upstream: AtomicUsize,
    query_ipv6: bool,
}

impl UpstreamLookup {
    /// Create a lookup using the default first-reply strategy
    pub fn new(upstreams: Vec<DnsServerSpec>) -> Result<Self> {
        Self::with_strategy(upstreams, UpstreamStrategy::default())
    }

    pub fn with_strategy(upstreams: Vec<DnsServerSpec>, strategy: UpstreamStrategy) -> Result<Self> {
        if upstreams.is_empty() {
            return Err(Error::Config("at least one upstream server is required".into()));
        }
        Ok(Self {
            upstreams,
            strategy,
            next_upstream: AtomicUsize::new(0),
            query_ipv6: true,
        })
    }

    /// Also ask for AAAA records (on by default)
    pub fn with_ipv6(mut self, query_ipv6: bool) -> Self {
        self.query_ipv6 = query_ipv6;
        self
    }

    pub fn upstreams(&self) -> &[DnsServerSpec] {
        &self.upstreams
    }

    pub fn strategy(&self) -> UpstreamStrategy {
        self.strategy
    }

    async fn query_records(&self, hostname: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let id = rand::random::<u16>();
        let query = build_query(hostname, record_type, id)?;
        let response = match self.strategy {
            UpstreamStrategy::FirstReply => self.forward_first_reply(&query).await?,
            UpstreamStrategy::RoundRobin => {
                let idx = self.next_upstream.fetch_add(1, Ordering::Relaxed) % self.upstreams.len();
                query_upstream(self.upstreams[idx], &query).await?
            }
            UpstreamStrategy::Random => {
                let upstream = self
                    .upstreams
                    .choose(&mut rand::rng())
                    .copied()
                    .ok_or_else(|| Error::Config("no upstream servers".into()))?;
                query_upstream(upstream, &query).await?
            }
        };
        extract_addresses(hostname, id, &response)
    }

    async fn forward_first_reply(&self, query: &[u8]) -> Result<Vec<u8>> {
        use tokio::sync::mpsc;

        if self.upstreams.len() == 1 {
            return query_upstream(self.upstreams[0], query).await;
        }

        let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(self.upstreams.len());
        for upstream in &self.upstreams {
            let upstream = *upstream;
            let query = query.to_vec();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(query_upstream(upstream, &query).await).await;
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::debug!("Upstream query failed: {}", e);
                    errors.push(e.to_string());
                }
            }
        }

        Err(Error::Dns(format!(
            "all {} upstreams failed: {}",
            errors.len(),
            errors.join("; ")
        )))
    }
}

#[async_trait]
impl HostLookup for UpstreamLookup {
    async fn lookup(&self, hostname: &str) -> Result<BTreeSet<IpAddr>> {
        let mut addrs: BTreeSet<IpAddr> = self
            .query_records(hostname, RecordType::A)
            .await?
            .into_iter()
            .collect();

        if self.query_ipv6 {
            // A missing AAAA answer is normal, only the A query decides failure
            match self.query_records(hostname, RecordType::AAAA).await {
                Ok(v6) => addrs.extend(v6),
                Err(e) => log::debug!("AAAA lookup for {} failed: {}", hostname, e),
            }
        }

        if addrs.is_empty() {
            return Err(Error::NoAddresses(hostname.to_string()));
        }
        Ok(addrs)
    }

    fn name(&self) -> String {
        let servers: Vec<String> = self.upstreams.iter().map(|u| u.to_string()).collect();
        format!("{} [{}]", self.strategy, servers.join(", "))
    }
}

/// Encode a recursive query for `hostname` with message id `id`
fn build_query(hostname: &str, record_type: RecordType, id: u16) -> Result<Vec<u8>> {
    let fqdn = if hostname.ends_with('.') {
        hostname.to_string()
    } else {
        format!("{}.", hostname)
    };
    let name = Name::from_ascii(&fqdn)
        .map_err(|e| Error::Dns(format!("invalid hostname '{}': {}", hostname, e)))?;

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));

    message
        .to_vec()
        .map_err(|e| Error::Dns(format!("failed to encode DNS query: {}", e)))
}

/// Pull A/AAAA addresses out of a raw response to query `id`
fn extract_addresses(hostname: &str, id: u16, response: &[u8]) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(response)
        .map_err(|e| Error::Dns(format!("invalid DNS response: {}", e)))?;

    if message.message_type() != MessageType::Response {
        return Err(Error::Dns(format!("reply for {} is not a response", hostname)));
    }
    if message.id() != id {
        return Err(Error::Dns(format!(
            "reply for {} has id {}, expected {}",
            hostname,
            message.id(),
            id
        )));
    }

    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(Error::NoAddresses(hostname.to_string())),
        code => return Err(Error::Dns(format!("{} answered {}", hostname, code))),
    }

    let addrs = message
        .answers()
        .iter()
        .filter_map(|answer| match answer.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Ok(addrs)
}

async fn query_upstream(upstream: DnsServerSpec, query: &[u8]) -> Result<Vec<u8>> {
    match upstream {
        DnsServerSpec::Udp { addr } => query_udp(addr, query).await,
        DnsServerSpec::Tcp { addr } => query_tcp(addr, query).await,
    }
}

async fn query_udp(addr: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind_addr = if addr.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::Dns(format!("failed to bind UDP socket: {}", e)))?;

    socket
        .send_to(query, addr)
        .await
        .map_err(|e| Error::Dns(format!("failed to send DNS query to {}: {}", addr, e)))?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let receive = async {
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            if peer != addr {
                log::debug!("Ignoring DNS datagram from {} (expected {})", peer, addr);
                continue;
            }
            // Replies to other queries are dropped here; the id lives in the first two bytes
            if len < 2 || buf[..2] != query[..2] {
                log::debug!("Ignoring DNS reply from {} with mismatched id", peer);
                continue;
            }
            return Ok::<usize, std::io::Error>(len);
        }
    };
    let received = tokio::time::timeout(DNS_TIMEOUT, receive).await;
    match received {
        Ok(Ok(len)) => {
            buf.truncate(len);
            Ok(buf)
        }
        Ok(Err(e)) => Err(Error::Dns(format!("failed to receive DNS response: {}", e))),
        Err(_) => Err(Error::Timeout(format!("UDP query to {}", addr))),
    }
}

async fn query_tcp(addr: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let mut stream = match tokio::time::timeout(DNS_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(Error::Dns(format!("TCP connect to {} failed: {}", addr, e))),
        Err(_) => return Err(Error::Timeout(format!("TCP connect to {}", addr))),
    };

    dns_over_stream(&mut stream, query).await
}

/// Length-prefixed DNS exchange over a byte stream
async fn dns_over_stream<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let len = u16::try_from(query.len()).map_err(|_| Error::Dns("DNS query too large".into()))?;
    let mut msg = Vec::with_capacity(2 + query.len());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(query);

    stream
        .write_all(&msg)
        .await
        .map_err(|e| Error::Dns(format!("stream write failed: {}", e)))?;

    let mut len_buf = [0u8; 2];
    match tokio::time::timeout(DNS_TIMEOUT, stream.read_exact(&mut len_buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(Error::Dns(format!("stream read failed: {}", e))),
        Err(_) => return Err(Error::Timeout("stream read".into())),
    }

    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > MAX_TCP_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }

    let mut response = vec![0u8; response_len];
    match tokio::time::timeout(DNS_TIMEOUT, stream.read_exact(&mut response)).await {
        Ok(Ok(_)) => Ok(response),
        Ok(Err(e)) => Err(Error::Dns(format!("stream read failed: {}", e))),
        Err(_) => Err(Error::Timeout("stream read".into())),
    }
}
