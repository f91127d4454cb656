//! NetFlow v9 PDU parsing.
//!
//! NetFlow v9 (RFC 3954) is template-based: template flowsets describe the
//! layout of later data flowsets, keyed by the sending host and the header
//! `source_id`. Options templates carry a scope section whose fields resolve
//! through the dictionary's `scope` category.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::SetHeader;
use crate::event::FlowEvent;
use crate::records::PduContext;
use crate::templates::{RawField, Template, TemplateKey};
use crate::Decoder;

const HEADER_SIZE: usize = 20;
const TEMPLATE_SET_ID: u16 = 0;
const OPTIONS_TEMPLATE_SET_ID: u16 = 1;

/// NetFlow v9 packet header (20 bytes, big-endian).
#[derive(Debug, Clone)]
struct V9Header {
    count: u16,
    sys_uptime: u32,
    unix_secs: u32,
    flow_sequence: u32,
    source_id: u32,
}

impl V9Header {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            count: u16::from_be_bytes([data[2], data[3]]),
            sys_uptime: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            unix_secs: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flow_sequence: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            source_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        })
    }
}

/// Parse one NetFlow v9 datagram and emit its data records.
pub(crate) fn parse(
    decoder: &Decoder,
    data: &[u8],
    host: &str,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    let header = match V9Header::from_bytes(data) {
        Some(header) => header,
        None => {
            warn!(
                message = "Datagram too short for NetFlow v9 header, dropping.",
                length = data.len(),
                host,
            );
            decoder.stats.record_dropped_datagram();
            return;
        }
    };

    debug!(
        message = "Parsing NetFlow v9 datagram.",
        count = header.count,
        source_id = header.source_id,
        host,
    );

    let ctx = PduContext {
        version: 9,
        host,
        domain: header.source_id,
        unix_secs: header.unix_secs,
        unix_nsecs: 0,
        sys_uptime_ms: Some(header.sys_uptime),
        flow_seq_num: Some(header.flow_sequence),
    };

    let mut offset = HEADER_SIZE;
    while offset + 4 <= data.len() {
        let set_header = match SetHeader::from_bytes(&data[offset..]) {
            Some(header) => header,
            None => {
                warn!(message = "Invalid flowset header, dropping rest of datagram.", offset, host);
                break;
            }
        };
        let set_end = offset + set_header.length as usize;
        if set_end > data.len() {
            warn!(
                message = "Flowset extends beyond datagram, dropping rest of datagram.",
                offset,
                set_length = set_header.length,
                datagram_length = data.len(),
            );
            break;
        }

        let set_body = &data[offset + 4..set_end];
        match set_header.set_id {
            TEMPLATE_SET_ID => parse_template_set(decoder, set_body, host, header.source_id),
            OPTIONS_TEMPLATE_SET_ID => {
                parse_options_template_set(decoder, set_body, host, header.source_id)
            }
            id if id >= 256 => {
                decode_data_set(decoder, id, set_body, &ctx, sink);
            }
            id => {
                warn!(message = "Reserved flowset id, skipping.", flowset_id = id);
            }
        }

        offset = set_end;
    }
}

/// Reject templates with no fields or a zero-width fixed layout.
fn template_validator(template: &Template) -> bool {
    !template.fields().is_empty() && template.fixed_width() != Some(0)
}

fn parse_template_set(decoder: &Decoder, body: &[u8], host: &str, source_id: u32) {
    let mut offset = 0;
    // trailing padding of fewer than 4 bytes ends the loop
    while offset + 4 <= body.len() {
        let template_id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let field_count = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let fields_end = offset + 4 + field_count * 4;
        if fields_end > body.len() {
            warn!(
                message = "Template record extends beyond flowset, dropping rest of set.",
                template_id,
                field_count,
            );
            break;
        }

        if template_id < 256 {
            warn!(message = "Template id below 256, skipping.", template_id);
            offset = fields_end;
            continue;
        }

        let mut raw = Vec::with_capacity(field_count);
        let mut spec_offset = offset + 4;
        for _ in 0..field_count {
            let field_type = u16::from_be_bytes([body[spec_offset], body[spec_offset + 1]]);
            let field_length = u16::from_be_bytes([body[spec_offset + 2], body[spec_offset + 3]]);
            raw.push(RawField::new(field_type, field_length, 0));
            spec_offset += 4;
        }

        register(decoder, TemplateKey::v9(host, source_id, template_id), &raw);
        offset = fields_end;
    }
}

fn parse_options_template_set(decoder: &Decoder, body: &[u8], host: &str, source_id: u32) {
    let mut offset = 0;
    while offset + 6 <= body.len() {
        let template_id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        // scope and option lengths are in bytes, four per field spec
        let scope_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let option_len = u16::from_be_bytes([body[offset + 4], body[offset + 5]]) as usize;
        let fields_end = offset + 6 + scope_len + option_len;
        if fields_end > body.len() || scope_len % 4 != 0 || option_len % 4 != 0 {
            warn!(
                message = "Malformed options template record, dropping rest of set.",
                template_id,
                scope_len,
                option_len,
            );
            break;
        }

        let mut raw = Vec::with_capacity((scope_len + option_len) / 4);
        let mut spec_offset = offset + 6;
        for i in 0..(scope_len + option_len) / 4 {
            let field_type = u16::from_be_bytes([body[spec_offset], body[spec_offset + 1]]);
            let field_length = u16::from_be_bytes([body[spec_offset + 2], body[spec_offset + 3]]);
            if i < scope_len / 4 {
                raw.push(RawField::scoped(field_type, field_length));
            } else {
                raw.push(RawField::new(field_type, field_length, 0));
            }
            spec_offset += 4;
        }

        register(decoder, TemplateKey::v9(host, source_id, template_id), &raw);
        offset = fields_end;
    }
}

fn register(decoder: &Decoder, key: TemplateKey, raw: &[RawField]) {
    if decoder
        .v9_templates
        .register(key.clone(), raw, Some(&template_validator))
        .is_some()
    {
        decoder.stats.record_registered_template();
        decoder.clear_missing_warning(&key);
        debug!(message = "Registered NetFlow v9 template.", %key, fields = raw.len());
    }
}

fn decode_data_set(
    decoder: &Decoder,
    flowset_id: u16,
    body: &[u8],
    ctx: &PduContext<'_>,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    let key = TemplateKey::v9(ctx.host, ctx.domain, flowset_id);
    let template = match decoder.v9_templates.fetch(&key) {
        Some(template) => template,
        None => {
            decoder.warn_missing_template(&key);
            return;
        }
    };

    let emitted =
        decoder
            .record_decoder()
            .decode_data_set(&template, flowset_id, body, ctx, sink);
    decoder.stats.add_records_decoded(emitted as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetflowConfig;

    fn decoder() -> Decoder {
        Decoder::new(NetflowConfig::default()).unwrap()
    }

    fn collect(decoder: &Decoder, payload: &[u8]) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        decoder.decode(payload, "10.0.0.1", &mut |_, event| events.push(event));
        events
    }

    fn v9_header(count: u16) -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0..2].copy_from_slice(&9u16.to_be_bytes()); // version
        data[2..4].copy_from_slice(&count.to_be_bytes()); // count
        data[4..8].copy_from_slice(&1_000_000u32.to_be_bytes()); // sys_uptime
        data[8..12].copy_from_slice(&1_700_000_000u32.to_be_bytes()); // unix_secs
        data[12..16].copy_from_slice(&100u32.to_be_bytes()); // flow_sequence
        data[16..20].copy_from_slice(&1u32.to_be_bytes()); // source_id
        data
    }

    fn template_set(template_id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend_from_slice(&0u16.to_be_bytes()); // set id
        set.extend_from_slice(&((8 + fields.len() * 4) as u16).to_be_bytes());
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (field_type, field_length) in fields {
            set.extend_from_slice(&field_type.to_be_bytes());
            set.extend_from_slice(&field_length.to_be_bytes());
        }
        set
    }

    #[test]
    fn truncated_header_drops_datagram() {
        let decoder = decoder();
        let events = collect(&decoder, &v9_header(0)[..10]);
        assert!(events.is_empty());
        assert_eq!(decoder.stats().datagrams_dropped, 1);
    }

    #[test]
    fn template_then_data_in_one_datagram() {
        let decoder = decoder();

        let mut data = v9_header(2);
        data.extend(template_set(256, &[(8, 4), (12, 4), (2, 4)]));
        // data flowset: two 12-byte records
        data.extend_from_slice(&256u16.to_be_bytes());
        data.extend_from_slice(&28u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]); // ipv4_src_addr
        data.extend_from_slice(&[5, 6, 7, 8]); // ipv4_dst_addr
        data.extend_from_slice(&7u32.to_be_bytes()); // in_pkts
        data.extend_from_slice(&[9, 9, 9, 9]);
        data.extend_from_slice(&[8, 8, 8, 8]);
        data.extend_from_slice(&3u32.to_be_bytes());

        let events = collect(&decoder, &data);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].get("version").unwrap().as_u64(), Some(9));
        assert_eq!(events[0].get("flow_seq_num").unwrap().as_u64(), Some(100));
        assert_eq!(
            events[0].get("ipv4_src_addr").unwrap().as_str(),
            Some("1.2.3.4")
        );
        assert_eq!(
            events[0].get("ipv4_dst_addr").unwrap().as_str(),
            Some("5.6.7.8")
        );
        assert_eq!(events[0].get("in_pkts").unwrap().as_u64(), Some(7));
        assert_eq!(
            events[1].get("ipv4_src_addr").unwrap().as_str(),
            Some("9.9.9.9")
        );
        assert_eq!(events[1].get("in_pkts").unwrap().as_u64(), Some(3));
        assert_eq!(decoder.stats().templates_registered, 1);
        assert_eq!(decoder.stats().records_decoded, 2);
    }

    #[test]
    fn data_without_template_warns_once() {
        let decoder = decoder();

        let mut data = v9_header(1);
        data.extend_from_slice(&300u16.to_be_bytes());
        data.extend_from_slice(&8u16.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);

        assert!(collect(&decoder, &data).is_empty());
        assert!(collect(&decoder, &data).is_empty());
        // same key twice, still one warning
        assert_eq!(decoder.stats().missing_template_warnings, 1);
    }

    #[test]
    fn unknown_field_rejects_template_and_later_data() {
        let decoder = decoder();

        let mut data = v9_header(1);
        data.extend(template_set(256, &[(8, 4), (65000, 4)]));
        assert!(collect(&decoder, &data).is_empty());
        assert_eq!(decoder.stats().templates_registered, 0);

        let mut data = v9_header(1);
        data.extend_from_slice(&256u16.to_be_bytes());
        data.extend_from_slice(&12u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        assert!(collect(&decoder, &data).is_empty());
        assert_eq!(decoder.stats().missing_template_warnings, 1);
    }

    #[test]
    fn replacement_template_resets_missing_warning() {
        let decoder = decoder();

        let mut data = v9_header(1);
        data.extend_from_slice(&256u16.to_be_bytes());
        data.extend_from_slice(&8u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        assert!(collect(&decoder, &data).is_empty());
        assert_eq!(decoder.stats().missing_template_warnings, 1);

        let mut data = v9_header(1);
        data.extend(template_set(256, &[(8, 4)]));
        collect(&decoder, &data);

        let mut data = v9_header(1);
        data.extend_from_slice(&256u16.to_be_bytes());
        data.extend_from_slice(&8u16.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        let events = collect(&decoder, &data);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn template_id_below_256_not_cached() {
        let decoder = decoder();
        let mut data = v9_header(1);
        data.extend(template_set(100, &[(8, 4)]));
        collect(&decoder, &data);
        assert_eq!(decoder.stats().templates_registered, 0);
        assert_eq!(decoder.v9_templates.len(), 0);
    }

    #[test]
    fn options_template_scope_and_option_fields() {
        let decoder = decoder();

        let mut data = v9_header(1);
        // options template set: scope (1 field) + options (3 fields)
        let mut set = Vec::new();
        set.extend_from_slice(&1u16.to_be_bytes()); // set id
        set.extend_from_slice(&26u16.to_be_bytes()); // 4 + 6 + 4*4
        set.extend_from_slice(&257u16.to_be_bytes()); // template id
        set.extend_from_slice(&4u16.to_be_bytes()); // scope length (bytes)
        set.extend_from_slice(&12u16.to_be_bytes()); // option length (bytes)
        set.extend_from_slice(&1u16.to_be_bytes()); // scope: system
        set.extend_from_slice(&2u16.to_be_bytes());
        set.extend_from_slice(&48u16.to_be_bytes()); // flow_sampler_id
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&49u16.to_be_bytes()); // flow_sampler_mode
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&50u16.to_be_bytes()); // flow_sampler_random_interval
        set.extend_from_slice(&4u16.to_be_bytes());
        data.extend(set);

        collect(&decoder, &data);
        assert_eq!(decoder.stats().templates_registered, 1);

        // option data: sampler announcement, goes to the sampler table
        let mut data = v9_header(1);
        data.extend_from_slice(&257u16.to_be_bytes());
        data.extend_from_slice(&12u16.to_be_bytes()); // 4 + 8 byte record
        data.extend_from_slice(&[0, 0]); // scope_system
        data.push(1); // sampler id
        data.push(2); // mode
        data.extend_from_slice(&100u32.to_be_bytes()); // interval

        let events = collect(&decoder, &data);
        assert!(events.is_empty());

        // flow record referencing the sampler gains the sampling fields
        let mut data = v9_header(2);
        data.extend(template_set(258, &[(48, 1), (1, 4)]));
        data.extend_from_slice(&258u16.to_be_bytes());
        data.extend_from_slice(&9u16.to_be_bytes());
        data.push(1); // flow_sampler_id
        data.extend_from_slice(&1500u32.to_be_bytes()); // in_bytes

        let events = collect(&decoder, &data);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].get("sampling_algorithm").unwrap().as_u64(),
            Some(2)
        );
        assert_eq!(
            events[0].get("sampling_interval").unwrap().as_u64(),
            Some(100)
        );
    }

    #[test]
    fn flowset_beyond_datagram_boundary_stops_parsing() {
        let decoder = decoder();
        let mut data = v9_header(1);
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&100u16.to_be_bytes()); // claims 100 bytes
        data.extend_from_slice(&[0u8; 8]); // only 8 present

        assert!(collect(&decoder, &data).is_empty());
    }
}
