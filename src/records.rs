//! Data-record decoding shared by NetFlow v9 and IPFIX.
//!
//! Given a data flowset's bytes and a resolved template, reads each record's
//! fields, normalizes timestamps, and assembles canonical events. Sampler
//! option records are routed to the [`SamplerTable`] instead of the sink, and
//! data records referencing a known sampler are decorated from it.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::event::{FlowEvent, Value};
use crate::fields::{ReadOutcome, Reader};
use crate::samplers::{Sampler, SamplerKey, SamplerTable};
use crate::templates::Template;

/// Safety cap on records decoded from a single flowset.
const MAX_RECORDS: usize = 10_000;

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Header-derived context for every record of one datagram.
pub(crate) struct PduContext<'a> {
    pub version: u16,
    pub host: &'a str,
    /// v9 `source_id` or IPFIX observation domain id.
    pub domain: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    /// Milliseconds since exporter boot; absent for IPFIX.
    pub sys_uptime_ms: Option<u32>,
    pub flow_seq_num: Option<u32>,
}

impl PduContext<'_> {
    /// The PDU export time, used as the event `@timestamp`.
    pub(crate) fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.unix_secs), self.unix_nsecs)
            .single()
            .unwrap_or_default()
    }
}

/// The record decoder proper; one per [`crate::Decoder`].
pub(crate) struct RecordDecoder<'a> {
    pub switched_times_from_uptime: bool,
    pub include_flowset_id: bool,
    pub samplers: &'a SamplerTable,
}

impl RecordDecoder<'_> {
    /// Decode every record in a data flowset body, emitting events through
    /// the sink. Returns the number of events emitted.
    pub(crate) fn decode_data_set(
        &self,
        template: &Template,
        flowset_id: u16,
        body: &[u8],
        ctx: &PduContext<'_>,
        sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
    ) -> usize {
        if body.is_empty() {
            return 0;
        }

        let mut emitted = 0;
        match template.fixed_width() {
            Some(width) => {
                if width == 0 || width > body.len() {
                    warn!(
                        message = "Template width does not fit flowset, dropping flowset.",
                        flowset_id,
                        template_width = width,
                        available = body.len(),
                    );
                    return 0;
                }
                let leftover = body.len() % width;
                if leftover > 3 {
                    warn!(
                        message = "Flowset length is not a multiple of the template width, dropping flowset.",
                        flowset_id,
                        template_width = width,
                        available = body.len(),
                        leftover,
                    );
                    return 0;
                }

                let count = (body.len() / width).min(MAX_RECORDS);
                for i in 0..count {
                    let mut reader = Reader::new(&body[i * width..(i + 1) * width]);
                    match self.decode_record(&mut reader, template, flowset_id, ctx) {
                        Some(event) => emitted += self.deliver(event, ctx, sink),
                        None => {
                            warn!(
                                message = "Truncated record in data flowset.",
                                flowset_id,
                                record = i,
                            );
                            break;
                        }
                    }
                }
            }
            None => {
                // variable-length layout: stream records to end of set
                let mut reader = Reader::new(body);
                let mut count = 0;
                while !reader.is_empty() && count < MAX_RECORDS {
                    let before = reader.position();
                    match self.decode_record(&mut reader, template, flowset_id, ctx) {
                        Some(event) => emitted += self.deliver(event, ctx, sink),
                        None => {
                            warn!(
                                message = "Truncated record in variable-length flowset.",
                                flowset_id,
                                record = count,
                            );
                            break;
                        }
                    }
                    if reader.position() == before {
                        break;
                    }
                    count += 1;
                }
            }
        }

        emitted
    }

    /// Read one record's fields into an event. `None` means the stream ran
    /// out mid-record.
    fn decode_record(
        &self,
        reader: &mut Reader<'_>,
        template: &Template,
        flowset_id: u16,
        ctx: &PduContext<'_>,
    ) -> Option<FlowEvent> {
        let mut event = FlowEvent::new();
        event.insert("@timestamp", ctx.timestamp());
        event.insert("version", u64::from(ctx.version));
        if let Some(seq) = ctx.flow_seq_num {
            event.insert("flow_seq_num", u64::from(seq));
        }
        if self.include_flowset_id {
            event.insert("flowset_id", u64::from(flowset_id));
        }

        for field in template.fields() {
            match field.spec.read(reader) {
                ReadOutcome::Value(value) => {
                    let value = self.normalize(&field.name, value, ctx);
                    event.insert(field.name.clone(), value);
                }
                ReadOutcome::Skipped => {}
                ReadOutcome::Truncated => return None,
            }
        }

        Some(event)
    }

    /// Route sampler option records to the sampler table; decorate and emit
    /// everything else. Returns 1 when an event went to the sink.
    fn deliver(
        &self,
        mut event: FlowEvent,
        ctx: &PduContext<'_>,
        sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
    ) -> usize {
        let sampler_id = event.get("flow_sampler_id").and_then(Value::as_u64);

        if let Some(sampler_id) = sampler_id {
            let mode = event.get("flow_sampler_mode").and_then(Value::as_u64);
            let interval = event
                .get("flow_sampler_random_interval")
                .and_then(Value::as_u64);

            if let (Some(mode), Some(random_interval)) = (mode, interval) {
                // a sampler announcement, not a flow
                self.samplers.insert(
                    SamplerKey {
                        host: Some(ctx.host.to_owned()),
                        domain: ctx.domain,
                        sampler_id,
                    },
                    Sampler {
                        mode,
                        random_interval,
                    },
                );
                debug!(
                    message = "Registered sampler from option record.",
                    sampler_id,
                    mode,
                    random_interval,
                );
                return 0;
            }

            let key = SamplerKey {
                host: Some(ctx.host.to_owned()),
                domain: ctx.domain,
                sampler_id,
            };
            if let Some(sampler) = self.samplers.get(&key) {
                event.insert_missing("sampling_algorithm", sampler.mode);
                event.insert_missing("sampling_interval", sampler.random_interval);
            }
        }

        sink(ctx.timestamp(), event);
        1
    }

    /// Normalize well-known timestamp fields; everything else passes through.
    fn normalize(&self, name: &str, value: Value, ctx: &PduContext<'_>) -> Value {
        let raw = match value {
            Value::UInt(raw) => raw,
            other => return other,
        };

        match name {
            "first_switched" | "last_switched" => {
                if self.switched_times_from_uptime {
                    return Value::UInt(raw);
                }
                match ctx.sys_uptime_ms.and_then(|uptime| {
                    switched_time_to_iso(ctx.unix_secs, ctx.unix_nsecs, uptime, raw)
                }) {
                    Some(rendered) => Value::String(rendered),
                    None => Value::UInt(raw),
                }
            }
            "flowStartSeconds" | "flowEndSeconds" => {
                format_ts(raw as i64, 0, "%Y-%m-%dT%H:%M:%S").unwrap_or(Value::UInt(raw))
            }
            "flowStartMilliseconds" | "flowEndMilliseconds" => format_ts(
                (raw / 1000) as i64,
                (raw % 1000) as u32 * 1_000_000,
                "%Y-%m-%dT%H:%M:%S%.3fZ",
            )
            .unwrap_or(Value::UInt(raw)),
            "flowStartMicroseconds" | "flowEndMicroseconds" => format_ts(
                (raw / 1_000_000) as i64,
                (raw % 1_000_000) as u32 * 1000,
                "%Y-%m-%dT%H:%M:%S%.6fZ",
            )
            .unwrap_or(Value::UInt(raw)),
            "flowStartNanoseconds" | "flowEndNanoseconds" => {
                if ctx.version == 10 {
                    // IPFIX: 64-bit NTP timestamp, seconds since 1900 in the
                    // high word and 2^-32 fractions in the low word
                    let secs = (raw >> 32) as i64 - NTP_UNIX_OFFSET;
                    let frac = raw & 0xFFFF_FFFF;
                    let nanos = ((frac as u128 * 1_000_000_000) >> 32) as u32;
                    format_ts(secs, nanos, "%Y-%m-%dT%H:%M:%S%.9fZ").unwrap_or(Value::UInt(raw))
                } else {
                    // v9 exporters send integer nanoseconds since the Unix
                    // epoch here
                    format_ts(
                        (raw / 1_000_000_000) as i64,
                        (raw % 1_000_000_000) as u32,
                        "%Y-%m-%dT%H:%M:%S%.9fZ",
                    )
                    .unwrap_or(Value::UInt(raw))
                }
            }
            _ => Value::UInt(raw),
        }
    }
}

/// Convert a boot-relative millisecond stamp to wall clock using the PDU's
/// export time and uptime, rendered ISO-8601 UTC with millisecond precision.
pub(crate) fn switched_time_to_iso(
    unix_secs: u32,
    unix_nsecs: u32,
    uptime_ms: u32,
    value_ms: u64,
) -> Option<String> {
    let now_us = i64::from(unix_secs) * 1_000_000 + i64::from(unix_nsecs) / 1000;
    let delta_us = (i64::from(uptime_ms) - value_ms as i64) * 1000;
    let event_us = now_us - delta_us;

    let secs = event_us.div_euclid(1_000_000);
    let micros = event_us.rem_euclid(1_000_000) as u32;
    match format_ts(secs, micros * 1000, "%Y-%m-%dT%H:%M:%S%.3fZ")? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn format_ts(secs: i64, nanos: u32, fmt: &str) -> Option<Value> {
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(|ts| Value::String(ts.format(fmt).to_string()))
}
