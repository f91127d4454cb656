//! Per-protocol PDU parsers and version dispatch.

pub(crate) mod ipfix;
pub(crate) mod netflow_v5;
pub(crate) mod netflow_v9;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::event::FlowEvent;
use crate::Decoder;

/// Dispatch one datagram on the 16-bit big-endian version in its first two
/// bytes. Unrecoverable parse problems are logged and the datagram dropped;
/// nothing propagates upward.
pub(crate) fn decode_datagram(
    decoder: &Decoder,
    payload: &[u8],
    host: &str,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    if payload.len() < 2 {
        warn!(
            message = "Datagram too short for a version field, dropping.",
            length = payload.len(),
            host,
        );
        decoder.stats.record_dropped_datagram();
        return;
    }

    let version = u16::from_be_bytes([payload[0], payload[1]]);
    if !matches!(version, 5 | 9 | 10) {
        warn!(message = "Unsupported flow version, dropping datagram.", version, host);
        decoder.stats.record_dropped_datagram();
        return;
    }
    if !decoder.config.is_version_enabled(version) {
        warn!(
            message = "Flow version not enabled in configuration, dropping datagram.",
            version,
            host,
        );
        decoder.stats.record_dropped_datagram();
        return;
    }

    match version {
        5 => netflow_v5::parse(decoder, payload, host, sink),
        9 => netflow_v9::parse(decoder, payload, host, sink),
        10 => ipfix::parse(decoder, payload, host, sink),
        _ => unreachable!("version checked above"),
    }
}

/// A v9 flowset / IPFIX set header: two big-endian u16s, id then total
/// length including the header itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SetHeader {
    pub set_id: u16,
    pub length: u16,
}

impl SetHeader {
    pub(crate) fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let set_id = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]);
        if length < 4 {
            return None;
        }
        Some(Self { set_id, length })
    }
}
