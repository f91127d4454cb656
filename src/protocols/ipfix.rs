//! IPFIX (NetFlow v10) PDU parsing.
//!
//! IPFIX (RFC 7011) carries the exporter identity in the header as an
//! observation domain id, so templates are keyed without the sending host.
//! Field specs may carry an enterprise bit selecting a vendor namespace, and
//! fields with the sentinel length 0xFFFF are variable-length with an inline
//! prefix.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::SetHeader;
use crate::event::FlowEvent;
use crate::records::PduContext;
use crate::templates::{RawField, Template, TemplateKey};
use crate::Decoder;

const HEADER_SIZE: usize = 16;
const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;

/// Enterprise bit on a field spec's type word.
const ENTERPRISE_BIT: u16 = 0x8000;

/// IPFIX message header (16 bytes, big-endian).
#[derive(Debug, Clone)]
struct IpfixHeader {
    length: u16,
    export_time: u32,
    sequence_number: u32,
    observation_domain_id: u32,
}

impl IpfixHeader {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u16::from_be_bytes([data[2], data[3]]),
            export_time: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            observation_domain_id: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }
}

/// Parse one IPFIX message and emit its data records.
pub(crate) fn parse(
    decoder: &Decoder,
    data: &[u8],
    host: &str,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    let header = match IpfixHeader::from_bytes(data) {
        Some(header) => header,
        None => {
            warn!(
                message = "Datagram too short for IPFIX header, dropping.",
                length = data.len(),
                host,
            );
            decoder.stats.record_dropped_datagram();
            return;
        }
    };

    if (header.length as usize) < HEADER_SIZE || header.length as usize > data.len() {
        warn!(
            message = "IPFIX length field disagrees with datagram, dropping.",
            claimed = header.length,
            actual = data.len(),
            host,
        );
        decoder.stats.record_dropped_datagram();
        return;
    }

    debug!(
        message = "Parsing IPFIX datagram.",
        length = header.length,
        sequence_number = header.sequence_number,
        observation_domain_id = header.observation_domain_id,
        host,
    );

    let ctx = PduContext {
        version: 10,
        host,
        domain: header.observation_domain_id,
        unix_secs: header.export_time,
        unix_nsecs: 0,
        sys_uptime_ms: None,
        flow_seq_num: None,
    };

    let message_end = header.length as usize;
    let mut offset = HEADER_SIZE;
    while offset + 4 <= message_end {
        let set_header = match SetHeader::from_bytes(&data[offset..]) {
            Some(header) => header,
            None => {
                warn!(message = "Invalid set header, dropping rest of message.", offset, host);
                break;
            }
        };
        let set_end = offset + set_header.length as usize;
        if set_end > message_end {
            warn!(
                message = "Set extends beyond message, dropping rest of message.",
                offset,
                set_length = set_header.length,
                message_length = message_end,
            );
            break;
        }

        let set_body = &data[offset + 4..set_end];
        match set_header.set_id {
            TEMPLATE_SET_ID => parse_template_set(decoder, set_body, header.observation_domain_id),
            OPTIONS_TEMPLATE_SET_ID => {
                parse_options_template_set(decoder, set_body, header.observation_domain_id)
            }
            id if id >= 256 => {
                decode_data_set(decoder, id, set_body, &ctx, sink);
            }
            id => {
                warn!(message = "Reserved set id, skipping.", set_id = id);
            }
        }

        offset = set_end;
    }
}

fn template_validator(template: &Template) -> bool {
    !template.fields().is_empty() && template.fixed_width() != Some(0)
}

/// Read `count` field specs, honoring the enterprise bit. Returns the raw
/// fields and the offset just past them, or `None` on truncation.
fn read_field_specs(body: &[u8], mut offset: usize, count: usize) -> Option<(Vec<RawField>, usize)> {
    let mut raw = Vec::with_capacity(count);
    for _ in 0..count {
        if offset + 4 > body.len() {
            return None;
        }
        let field_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let field_length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]);
        offset += 4;

        let enterprise_id = if field_type & ENTERPRISE_BIT != 0 {
            if offset + 4 > body.len() {
                return None;
            }
            let enterprise = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]);
            offset += 4;
            enterprise
        } else {
            0
        };

        raw.push(RawField::new(
            field_type & !ENTERPRISE_BIT,
            field_length,
            enterprise_id,
        ));
    }
    Some((raw, offset))
}

fn parse_template_set(decoder: &Decoder, body: &[u8], domain: u32) {
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let template_id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let field_count = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;

        if field_count == 0 {
            // template withdrawal, not carried in the cache model
            debug!(message = "Ignoring template withdrawal.", template_id);
            offset += 4;
            continue;
        }

        let (raw, next) = match read_field_specs(body, offset + 4, field_count) {
            Some(parsed) => parsed,
            None => {
                warn!(
                    message = "Template record extends beyond set, dropping rest of set.",
                    template_id,
                    field_count,
                );
                break;
            }
        };

        if template_id < 256 {
            warn!(message = "Template id below 256, skipping.", template_id);
            offset = next;
            continue;
        }

        register(decoder, TemplateKey::ipfix(domain, template_id), &raw);
        offset = next;
    }
}

fn parse_options_template_set(decoder: &Decoder, body: &[u8], domain: u32) {
    let mut offset = 0;
    while offset + 6 <= body.len() {
        let template_id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let field_count = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let scope_field_count = u16::from_be_bytes([body[offset + 4], body[offset + 5]]) as usize;

        if field_count == 0 {
            debug!(message = "Ignoring options template withdrawal.", template_id);
            offset += 6;
            continue;
        }
        if scope_field_count > field_count {
            warn!(
                message = "Options template scope count exceeds field count, dropping rest of set.",
                template_id,
                field_count,
                scope_field_count,
            );
            break;
        }

        let (raw, next) = match read_field_specs(body, offset + 6, field_count) {
            Some(parsed) => parsed,
            None => {
                warn!(
                    message = "Options template record extends beyond set, dropping rest of set.",
                    template_id,
                    field_count,
                );
                break;
            }
        };

        register(decoder, TemplateKey::ipfix(domain, template_id), &raw);
        offset = next;
    }
}

fn register(decoder: &Decoder, key: TemplateKey, raw: &[RawField]) {
    if decoder
        .ipfix_templates
        .register(key.clone(), raw, Some(&template_validator))
        .is_some()
    {
        decoder.stats.record_registered_template();
        decoder.clear_missing_warning(&key);
        debug!(message = "Registered IPFIX template.", %key, fields = raw.len());
    }
}

fn decode_data_set(
    decoder: &Decoder,
    set_id: u16,
    body: &[u8],
    ctx: &PduContext<'_>,
    sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
) {
    let key = TemplateKey::ipfix(ctx.domain, set_id);
    let template = match decoder.ipfix_templates.fetch(&key) {
        Some(template) => template,
        None => {
            decoder.warn_missing_template(&key);
            return;
        }
    };

    let emitted = decoder
        .record_decoder()
        .decode_data_set(&template, set_id, body, ctx, sink);
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

    /// Build an IPFIX message from sets, fixing up the length field.
    fn message(sets: &[Vec<u8>]) -> Vec<u8> {
        let mut data = vec![0u8; 16];
        data[0..2].copy_from_slice(&10u16.to_be_bytes()); // version
        data[4..8].copy_from_slice(&1_700_000_000u32.to_be_bytes()); // export_time
        data[8..12].copy_from_slice(&42u32.to_be_bytes()); // sequence
        data[12..16].copy_from_slice(&7u32.to_be_bytes()); // observation domain
        for set in sets {
            data.extend_from_slice(set);
        }
        let length = data.len() as u16;
        data[2..4].copy_from_slice(&length.to_be_bytes());
        data
    }

    fn template_set(template_id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&((8 + fields.len() * 4) as u16).to_be_bytes());
        set.extend_from_slice(&template_id.to_be_bytes());
        set.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (field_type, field_length) in fields {
            set.extend_from_slice(&field_type.to_be_bytes());
            set.extend_from_slice(&field_length.to_be_bytes());
        }
        set
    }

    fn data_set(set_id: u16, body: &[u8]) -> Vec<u8> {
        let mut set = Vec::new();
        set.extend_from_slice(&set_id.to_be_bytes());
        set.extend_from_slice(&((4 + body.len()) as u16).to_be_bytes());
        set.extend_from_slice(body);
        set
    }

    #[test]
    fn truncated_header_drops_datagram() {
        let decoder = decoder();
        let payload = message(&[]);
        assert!(collect(&decoder, &payload[..10]).is_empty());
        assert_eq!(decoder.stats().datagrams_dropped, 1);
    }

    #[test]
    fn length_mismatch_drops_datagram() {
        let decoder = decoder();
        let mut payload = message(&[]);
        payload[2..4].copy_from_slice(&200u16.to_be_bytes()); // longer than reality
        assert!(collect(&decoder, &payload).is_empty());
        assert_eq!(decoder.stats().datagrams_dropped, 1);
    }

    #[test]
    fn template_then_data() {
        let decoder = decoder();

        let payload = message(&[template_set(256, &[(8, 4), (12, 4), (2, 4)])]);
        assert!(collect(&decoder, &payload).is_empty());
        assert_eq!(decoder.stats().templates_registered, 1);

        let mut body = Vec::new();
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.extend_from_slice(&[5, 6, 7, 8]);
        body.extend_from_slice(&9u32.to_be_bytes());
        let payload = message(&[data_set(256, &body)]);

        let events = collect(&decoder, &payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("version").unwrap().as_u64(), Some(10));
        assert!(events[0].get("flow_seq_num").is_none());
        assert_eq!(
            events[0].get("sourceIPv4Address").unwrap().as_str(),
            Some("1.2.3.4")
        );
        assert_eq!(
            events[0].get("destinationIPv4Address").unwrap().as_str(),
            Some("5.6.7.8")
        );
        assert_eq!(events[0].get("packetDeltaCount").unwrap().as_u64(), Some(9));
    }

    #[test]
    fn enterprise_fields_resolve_through_vendor_namespace() {
        let decoder = decoder();

        // reverseOctetDeltaCount: enterprise 29305, field 1, 8 bytes
        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&16u16.to_be_bytes()); // 4 + 4 + 4 + 4
        set.extend_from_slice(&256u16.to_be_bytes());
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&(1u16 | ENTERPRISE_BIT).to_be_bytes());
        set.extend_from_slice(&8u16.to_be_bytes());
        set.extend_from_slice(&29305u32.to_be_bytes());

        let payload = message(&[set]);
        collect(&decoder, &payload);
        assert_eq!(decoder.stats().templates_registered, 1);

        let payload = message(&[data_set(256, &77u64.to_be_bytes())]);
        let events = collect(&decoder, &payload);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].get("reverseOctetDeltaCount").unwrap().as_u64(),
            Some(77)
        );
    }

    #[test]
    fn unknown_enterprise_rejects_template() {
        let decoder = decoder();

        let mut set = Vec::new();
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&16u16.to_be_bytes());
        set.extend_from_slice(&256u16.to_be_bytes());
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&(1u16 | ENTERPRISE_BIT).to_be_bytes());
        set.extend_from_slice(&8u16.to_be_bytes());
        set.extend_from_slice(&99999u32.to_be_bytes());

        let payload = message(&[set]);
        collect(&decoder, &payload);
        assert_eq!(decoder.stats().templates_registered, 0);
        assert!(decoder.ipfix_templates.is_empty());
    }

    #[test]
    fn missing_template_warns_once_per_key() {
        let decoder = decoder();
        let payload = message(&[data_set(256, &[0, 0, 0, 0])]);
        assert!(collect(&decoder, &payload).is_empty());
        assert!(collect(&decoder, &payload).is_empty());
        assert_eq!(decoder.stats().missing_template_warnings, 1);

        // a different template id warns separately
        let payload = message(&[data_set(257, &[0, 0, 0, 0])]);
        assert!(collect(&decoder, &payload).is_empty());
        assert_eq!(decoder.stats().missing_template_warnings, 2);
    }

    #[test]
    fn options_template_registers_sampler_flow() {
        let decoder = decoder();

        // options template 257: scope observationDomainId + sampler triple
        let mut set = Vec::new();
        set.extend_from_slice(&OPTIONS_TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&26u16.to_be_bytes()); // 4 + 6 + 4*4
        set.extend_from_slice(&257u16.to_be_bytes());
        set.extend_from_slice(&4u16.to_be_bytes()); // field count
        set.extend_from_slice(&1u16.to_be_bytes()); // scope field count
        set.extend_from_slice(&149u16.to_be_bytes()); // observationDomainId
        set.extend_from_slice(&4u16.to_be_bytes());
        set.extend_from_slice(&48u16.to_be_bytes()); // flow_sampler_id
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&49u16.to_be_bytes()); // flow_sampler_mode
        set.extend_from_slice(&1u16.to_be_bytes());
        set.extend_from_slice(&50u16.to_be_bytes()); // flow_sampler_random_interval
        set.extend_from_slice(&4u16.to_be_bytes());

        let payload = message(&[set]);
        collect(&decoder, &payload);
        assert_eq!(decoder.stats().templates_registered, 1);

        // sampler announcement: no events, sampler table populated
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes()); // scope value
        body.push(3); // sampler id
        body.push(2); // mode
        body.extend_from_slice(&1000u32.to_be_bytes());
        let payload = message(&[data_set(257, &body)]);
        assert!(collect(&decoder, &payload).is_empty());

        // data template + record referencing sampler 3
        let payload = message(&[template_set(300, &[(48, 1), (1, 4)])]);
        collect(&decoder, &payload);

        let mut body = Vec::new();
        body.push(3);
        body.extend_from_slice(&64u32.to_be_bytes());
        let payload = message(&[data_set(300, &body)]);
        let events = collect(&decoder, &payload);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].get("sampling_algorithm").unwrap().as_u64(),
            Some(2)
        );
        assert_eq!(
            events[0].get("sampling_interval").unwrap().as_u64(),
            Some(1000)
        );
    }

    #[test]
    fn variable_length_field_in_data_set() {
        let decoder = decoder();
        let payload = message(&[template_set(256, &[(8, 4), (82, 0xFFFF)])]);
        collect(&decoder, &payload);

        let mut body = Vec::new();
        body.extend_from_slice(&[10, 0, 0, 1]);
        body.push(4);
        body.extend_from_slice(b"eth0");
        let payload = message(&[data_set(256, &body)]);

        let events = collect(&decoder, &payload);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].get("interfaceName").unwrap().as_str(),
            Some("eth0")
        );
    }

    #[test]
    fn include_flowset_id_adds_field() {
        let config = NetflowConfig {
            include_flowset_id: true,
            ..Default::default()
        };
        let decoder = Decoder::new(config).unwrap();

        let payload = message(&[template_set(256, &[(8, 4)])]);
        collect(&decoder, &payload);
        let payload = message(&[data_set(256, &[1, 2, 3, 4])]);
        let events = collect(&decoder, &payload);
        assert_eq!(events[0].get("flowset_id").unwrap().as_u64(), Some(256));
    }

    #[test]
    fn reserved_set_ids_are_skipped() {
        let decoder = decoder();
        let mut set = Vec::new();
        set.extend_from_slice(&5u16.to_be_bytes()); // reserved
        set.extend_from_slice(&8u16.to_be_bytes());
        set.extend_from_slice(&[0, 0, 0, 0]);
        let payload = message(&[set, template_set(256, &[(8, 4)])]);
        collect(&decoder, &payload);
        // parsing continued past the reserved set
        assert_eq!(decoder.stats().templates_registered, 1);
    }
}
