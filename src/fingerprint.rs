//! Resolver fingerprinting.
//!
//! Before any data moves, every configured resolver is probed with
//! checksum-verified `NOP` queries: once with the case-insensitive base-32
//! alphabet, and (if clean) again with base-58 to learn whether the
//! resolver preserves case end-to-end. Resolvers that corrupt, drop, or
//! time out are evicted before the session goes live.

use crate::encoders::{Base32, Base58, Encoder};
use crate::framing::{msg_id, Framer, MessageKind, TunnelMessage};
use crate::resolver::{DnsResolver, SharedResolver};
use prost::Message;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on the per-resolver RTT sample window.
pub(crate) const METRICS_MAX: usize = 8;

/// Per-resolver state gathered during fingerprinting. Immutable once the
/// session is established.
pub struct ResolverMetadata {
    pub address: String,
    pub enable_base58: bool,
    /// Observed round-trip times, newest first, at most [`METRICS_MAX`].
    pub metrics: Vec<Duration>,
    pub errors: usize,
}

impl ResolverMetadata {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            enable_base58: false,
            metrics: Vec::new(),
            errors: 0,
        }
    }

    fn record_rtt(&mut self, rtt: Duration) {
        self.metrics.insert(0, rtt);
        self.metrics.truncate(METRICS_MAX);
    }

    pub fn average_rtt(&self) -> Duration {
        if self.metrics.is_empty() {
            return Duration::ZERO;
        }
        self.metrics.iter().sum::<Duration>() / self.metrics.len() as u32
    }
}

/// Probes every resolver concurrently and returns the metadata keyed by
/// resolver address. Callers evict any entry with a non-zero error count.
pub(crate) fn fingerprint_resolvers(
    framer: &Framer,
    session_id: u32,
    force_base32: bool,
    resolvers: &[SharedResolver],
) -> HashMap<String, ResolverMetadata> {
    debug!(resolvers = resolvers.len(), "fingerprinting resolvers");
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for (worker_id, resolver) in resolvers.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move || {
                let meta = fingerprint_resolver(
                    framer,
                    session_id,
                    force_base32,
                    worker_id as u32,
                    resolver.as_ref(),
                );
                let _ = tx.send(meta);
            });
        }
    });
    drop(tx);
    rx.iter().map(|meta| (meta.address.clone(), meta)).collect()
}

fn fingerprint_resolver(
    framer: &Framer,
    session_id: u32,
    force_base32: bool,
    worker_id: u32,
    resolver: &dyn DnsResolver,
) -> ResolverMetadata {
    let mut meta = ResolverMetadata::new(resolver.address());
    benchmark(framer, &Base32, resolver, session_id, worker_id, &mut meta);
    if meta.errors == 0 && !force_base32 {
        benchmark(framer, &Base58, resolver, session_id, worker_id, &mut meta);
        if meta.errors == 0 {
            meta.enable_base58 = true;
        } else {
            // Base-32 already proved clean; the richer alphabet just isn't
            // usable through this resolver.
            warn!(resolver = %meta.address, "base58 probes corrupted, falling back to base32");
            meta.enable_base58 = false;
            meta.errors = 0;
        }
    }
    debug!(
        resolver = %meta.address,
        avg_rtt = ?meta.average_rtt(),
        base58 = meta.enable_base58,
        errors = meta.errors,
        "fingerprint complete"
    );
    meta
}

/// Issues [`METRICS_MAX`]`/2` checksum probes through one alphabet. The
/// controller answers each `NOP` with the CRC-32 of the serialized record
/// it received; any mismatch means the resolver mangled the query.
fn benchmark(
    framer: &Framer,
    encoder: &dyn Encoder,
    resolver: &dyn DnsResolver,
    session_id: u32,
    worker_id: u32,
    meta: &mut ResolverMetadata,
) {
    for _ in 0..METRICS_MAX / 2 {
        let (probe, checksum) = probe_msg(session_id, worker_id);
        let domain = match framer.join_subdata(&encoder.encode(&probe)) {
            Ok(domain) => domain,
            Err(_) => {
                meta.errors += 1;
                continue;
            }
        };
        match resolver.a(&domain) {
            Ok((answer, rtt)) => {
                if answer.len() != 4 {
                    meta.errors += 1;
                    continue;
                }
                let echoed = u32::from_le_bytes([answer[0], answer[1], answer[2], answer[3]]);
                if echoed != checksum {
                    debug!(
                        resolver = %meta.address,
                        expected = checksum,
                        got = echoed,
                        "probe checksum mismatch"
                    );
                    meta.errors += 1;
                    continue;
                }
                meta.record_rtt(rtt);
            }
            Err(_) => meta.errors += 1,
        }
    }
}

fn probe_msg(session_id: u32, worker_id: u32) -> (Vec<u8>, u32) {
    let mut payload = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut payload);
    let msg = TunnelMessage {
        id: msg_id(session_id, worker_id),
        kind: MessageKind::Nop as i32,
        data: payload.to_vec(),
        ..Default::default()
    };
    let serialized = msg.encode_to_vec();
    let checksum = crc32_ieee(&serialized);
    (serialized, checksum)
}

/// CRC-32 over the IEEE polynomial, bit-reflected.
pub(crate) fn crc32_ieee(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}
