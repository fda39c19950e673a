//! Raw DNS resolution against a single recursive resolver.
//!
//! Each resolver issues one question per query (`A` for handshake probes,
//! `TXT` for data), applies the session's retry policy internally, and
//! reports the measured round-trip time alongside the answer payload.

use crate::config::Config;
use crate::error::TunnelError;
use rand::Rng;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{Name, RData, RecordType};
use trust_dns_proto::serialize::binary::{BinEncodable, BinEncoder};

const DEFAULT_DNS_PORT: u16 = 53;

/// Issues a single DNS question and returns the answer payload with the
/// measured round-trip time.
pub trait DnsResolver: Send + Sync {
    fn address(&self) -> &str;

    /// `A` lookup; the answer is 4 bytes of opaque payload per record.
    fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError>;

    /// `TXT` lookup; the answer is the concatenation of the record's
    /// character-strings.
    fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError>;
}

pub type SharedResolver = Arc<dyn DnsResolver>;

/// Resolver backed by plain UDP queries to one endpoint.
pub struct GenericResolver {
    address: String,
    endpoint: SocketAddr,
    retry_wait: Duration,
    retry_count: usize,
    query_timeout: Duration,
}

impl GenericResolver {
    pub fn new(
        endpoint: SocketAddr,
        retry_wait: Duration,
        retry_count: usize,
        query_timeout: Duration,
    ) -> Self {
        Self {
            address: endpoint.to_string(),
            endpoint,
            retry_wait,
            retry_count,
            query_timeout,
        }
    }

    fn query(&self, fqdn: &str, record_type: RecordType) -> Result<(Vec<u8>, Duration), TunnelError> {
        let mut attempts_remaining = self.retry_count.max(1);
        loop {
            let started = Instant::now();
            match self.attempt(fqdn, record_type) {
                Ok(payload) => return Ok((payload, started.elapsed())),
                Err(err) => {
                    attempts_remaining -= 1;
                    debug!(
                        resolver = %self.address,
                        %err,
                        attempts_remaining,
                        "query attempt failed"
                    );
                    if attempts_remaining == 0 {
                        return Err(TunnelError::Timeout);
                    }
                    thread::sleep(self.retry_wait);
                }
            }
        }
    }

    fn attempt(&self, fqdn: &str, record_type: RecordType) -> io::Result<Vec<u8>> {
        let name = Name::from_ascii(fqdn)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut msg = Message::new();
        msg.set_id(rand::thread_rng().gen());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name, record_type));

        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        msg.emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(self.query_timeout))?;
        socket.send_to(&buf, self.endpoint)?;

        let mut resp_buf = [0u8; 4096];
        let (size, _) = socket.recv_from(&mut resp_buf)?;
        let resp = Message::from_vec(&resp_buf[..size])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut payload = Vec::new();
        for record in resp.answers() {
            match record.data() {
                Some(RData::A(ip)) => payload.extend_from_slice(&ip.0.octets()),
                Some(RData::TXT(txt)) => {
                    for part in txt.txt_data() {
                        payload.extend_from_slice(part);
                    }
                }
                _ => {}
            }
        }
        Ok(payload)
    }
}

impl DnsResolver for GenericResolver {
    fn address(&self) -> &str {
        &self.address
    }

    fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError> {
        self.query(fqdn, RecordType::A)
    }

    fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError> {
        self.query(fqdn, RecordType::TXT)
    }
}


/// Builds one resolver per configured endpoint, falling back to the
/// platform's nameservers when none are configured. A configured endpoint
/// that cannot be resolved is an error; discovered ones are best-effort.
pub fn resolvers_from_config(cfg: &Config) -> Result<Vec<SharedResolver>, TunnelError> {
    let mut endpoints = Vec::new();
    for spec in cfg.resolvers.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        endpoints.push(resolve_endpoint(spec)?);
    }
    if endpoints.is_empty() {
        endpoints = nameservers_from_resolv_conf(RESOLV_CONF_PATH);
    }
    if endpoints.is_empty() {
        return Err(TunnelError::NoResolvers);
    }

    Ok(endpoints
        .into_iter()
        .map(|endpoint| {
            Arc::new(GenericResolver::new(
                endpoint,
                cfg.retry_wait(),
                cfg.retry_count,
                cfg.query_timeout(),
            )) as SharedResolver
        })
        .collect())
}

const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Turns `host` or `host:port` into a socket address, port 53 implied.
fn resolve_endpoint(spec: &str) -> Result<SocketAddr, TunnelError> {
    let mut candidates = if spec.contains(':') {
        spec.to_socket_addrs()
    } else {
        (spec, DEFAULT_DNS_PORT).to_socket_addrs()
    }
    .map_err(|e| TunnelError::Config(format!("invalid resolver {spec}: {e}")))?;

    candidates
        .next()
        .ok_or_else(|| TunnelError::Config(format!("resolver {spec} has no address")))
}

/// Pulls `nameserver` entries out of a resolv.conf-style file. Anything
/// unreadable or unparsable is logged and skipped; other directives are
/// ignored.
fn nameservers_from_resolv_conf(path: &str) -> Vec<SocketAddr> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(%err, path, "cannot read resolver configuration");
            return Vec::new();
        }
    };

    let mut endpoints = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        if let Some(server) = fields.next() {
            match resolve_endpoint(server) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => debug!(%err, server, "skipping nameserver entry"),
            }
        }
    }
    debug!(path, found = endpoints.len(), "discovered platform nameservers");
    endpoints
}
