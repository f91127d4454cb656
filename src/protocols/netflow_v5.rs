//! NetFlow v5 fast path.
//!
//! v5 is fixed-layout: a 24-byte header followed by 48-byte records, all
//! big-endian. No templates are involved; the decoder produces events with
//! the same contract as the template-driven versions.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::event::FlowEvent;
use crate::records::switched_time_to_iso;
use crate::Decoder;

const HEADER_SIZE: usize = 24;
const RECORD_SIZE: usize = 48;

/// NetFlow v5 packet header (24 bytes, big-endian).
#[derive(Debug, Clone)]
struct V5Header {
    flow_records: u16,
    sys_uptime: u32,
    unix_secs: u32,
    unix_nsecs: u32,
    flow_seq_num: u32,
    engine_type: u8,
    engine_id: u8,
    sampling_algorithm: u8,
    sampling_interval: u16,
}

impl V5Header {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        // engine and sampling are single u16s split into bitfields:
        // engine_type is the high byte, sampling_algorithm the top two bits
        let engine = u16::from_be_bytes([data[20], data[21]]);
        let sampling = u16::from_be_bytes([data[22], data[23]]);
        Some(Self {
            flow_records: u16::from_be_bytes([data[2], data[3]]),
            sys_uptime: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            unix_secs: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            unix_nsecs: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            flow_seq_num: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            engine_type: (engine >> 8) as u8,
            engine_id: (engine & 0xFF) as u8,
            sampling_algorithm: (sampling >> 14) as u8,
            sampling_interval: sampling & 0x3FFF,
        })
    }
}

/// Parse one NetFlow v5 datagram and emit an event per record.
pub(crate) fn parse(
    decoder: &Decoder,
    data: &[u8],
    host: &str,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    let header = match V5Header::from_bytes(data) {
        Some(header) => header,
        None => {
            warn!(
                message = "Datagram too short for NetFlow v5 header, dropping.",
                length = data.len(),
                host,
            );
            decoder.stats.record_dropped_datagram();
            return;
        }
    };

    let expected = header.flow_records as usize * RECORD_SIZE;
    if data.len() - HEADER_SIZE != expected {
        warn!(
            message = "NetFlow v5 record count disagrees with datagram length, dropping.",
            flow_records = header.flow_records,
            expected_bytes = expected,
            actual_bytes = data.len() - HEADER_SIZE,
            host,
        );
        decoder.stats.record_dropped_datagram();
        return;
    }

    debug!(
        message = "Parsing NetFlow v5 datagram.",
        flow_records = header.flow_records,
        host,
    );

    let timestamp = Utc
        .timestamp_opt(i64::from(header.unix_secs), header.unix_nsecs)
        .single()
        .unwrap_or_default();

    for i in 0..header.flow_records as usize {
        let record = &data[HEADER_SIZE + i * RECORD_SIZE..HEADER_SIZE + (i + 1) * RECORD_SIZE];
        let event = decode_record(decoder, &header, timestamp, record);
        sink(timestamp, event);
        decoder.stats.add_records_decoded(1);
    }
}

fn decode_record(
    decoder: &Decoder,
    header: &V5Header,
    timestamp: DateTime<Utc>,
    record: &[u8],
) -> FlowEvent {
    let mut event = FlowEvent::new();
    event.insert("@timestamp", timestamp);
    event.insert("version", 5u64);
    event.insert("flow_seq_num", u64::from(header.flow_seq_num));
    event.insert("engine_type", u64::from(header.engine_type));
    event.insert("engine_id", u64::from(header.engine_id));
    event.insert("sampling_algorithm", u64::from(header.sampling_algorithm));
    event.insert("sampling_interval", u64::from(header.sampling_interval));
    event.insert("flow_records", u64::from(header.flow_records));

    let ipv4 = |off: usize| {
        format!(
            "{}.{}.{}.{}",
            record[off],
            record[off + 1],
            record[off + 2],
            record[off + 3]
        )
    };
    let u16_at = |off: usize| u64::from(u16::from_be_bytes([record[off], record[off + 1]]));
    let u32_at = |off: usize| {
        u64::from(u32::from_be_bytes([
            record[off],
            record[off + 1],
            record[off + 2],
            record[off + 3],
        ]))
    };

    event.insert("ipv4_src_addr", ipv4(0));
    event.insert("ipv4_dst_addr", ipv4(4));
    event.insert("ipv4_next_hop", ipv4(8));
    event.insert("input_snmp", u16_at(12));
    event.insert("output_snmp", u16_at(14));
    event.insert("in_pkts", u32_at(16));
    event.insert("in_bytes", u32_at(20));
    insert_switched(decoder, &mut event, "first_switched", header, u32_at(24));
    insert_switched(decoder, &mut event, "last_switched", header, u32_at(28));
    event.insert("l4_src_port", u16_at(32));
    event.insert("l4_dst_port", u16_at(34));
    // byte 36 is padding
    event.insert("tcp_flags", u64::from(record[37]));
    event.insert("protocol", u64::from(record[38]));
    event.insert("src_tos", u64::from(record[39]));
    event.insert("src_as", u16_at(40));
    event.insert("dst_as", u16_at(42));
    event.insert("src_mask", u64::from(record[44]));
    event.insert("dst_mask", u64::from(record[45]));
    // bytes 46..48 are padding

    event
}

fn insert_switched(
    decoder: &Decoder,
    event: &mut FlowEvent,
    name: &str,
    header: &V5Header,
    value_ms: u64,
) {
    if decoder.config.switched_times_from_uptime {
        event.insert(name, value_ms);
        return;
    }
    match switched_time_to_iso(header.unix_secs, header.unix_nsecs, header.sys_uptime, value_ms) {
        Some(rendered) => event.insert(name, rendered),
        None => event.insert(name, value_ms),
    }
}
