//! Template-driven decoder for Cisco NetFlow v5, NetFlow v9 and IPFIX.
//!
//! The decoder takes one UDP payload at a time plus the sender's host
//! identity and emits `(timestamp, event)` pairs through a caller-supplied
//! sink. NetFlow v9 and IPFIX are template-based: template flowsets describe
//! the layout of later data flowsets, and the decoder keeps a time-expiring
//! cache of templates per exporter (optionally persisted to disk for IPFIX).
//! NetFlow v5 is a fixed-layout fast path with the same output contract.
//!
//! A single malformed datagram never fails the caller: per-datagram parse
//! problems are logged and the datagram dropped.
//!
//! ```
//! use netflow_codec::{Decoder, NetflowConfig};
//!
//! let decoder = Decoder::new(NetflowConfig::default()).unwrap();
//!
//! // a NetFlow v5 header with zero records
//! let mut datagram = vec![0u8; 24];
//! datagram[0..2].copy_from_slice(&5u16.to_be_bytes());
//!
//! let mut events = Vec::new();
//! decoder.decode(&datagram, "192.0.2.1", &mut |timestamp, event| {
//!     events.push((timestamp, event));
//! });
//! assert!(events.is_empty());
//! ```

pub mod config;
pub mod event;
pub mod fields;
mod protocols;
mod records;
pub mod samplers;
pub mod templates;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

pub use config::{ConfigError, NetflowConfig};
pub use event::{FlowEvent, Value};
pub use samplers::{Sampler, SamplerKey, SamplerTable};
pub use templates::{PersistError, RawField, Template, TemplateKey, TemplateRegistry};

use fields::FieldDictionary;
use records::RecordDecoder;

/// The flow decoder. Safe to share across producer threads; the template
/// registries and the sampler table carry their own locks.
pub struct Decoder {
    pub(crate) config: NetflowConfig,
    pub(crate) v9_templates: TemplateRegistry,
    pub(crate) ipfix_templates: TemplateRegistry,
    pub(crate) samplers: SamplerTable,
    pub(crate) stats: StatsInner,
    missing_warned: Mutex<HashSet<TemplateKey>>,
}

impl Decoder {
    /// Build a decoder. Fails only on invalid configuration or unloadable
    /// field definitions.
    pub fn new(config: NetflowConfig) -> Result<Self, ConfigError> {
        config
            .validate()
            .map_err(|reasons| ConfigError::InvalidConfig { reasons })?;

        let v9_dictionary = Arc::new(FieldDictionary::netflow_v9(config.definitions.as_deref())?);
        let ipfix_dictionary = Arc::new(FieldDictionary::ipfix(config.ipfix_definitions.as_deref())?);

        let ttl = Duration::from_secs(config.cache_ttl);
        let v9_templates = TemplateRegistry::new(ttl, v9_dictionary, None);
        let ipfix_templates =
            TemplateRegistry::new(ttl, ipfix_dictionary, config.ipfix_cache_file());
        let samplers = SamplerTable::new(ttl);

        Ok(Self {
            config,
            v9_templates,
            ipfix_templates,
            samplers,
            stats: StatsInner::default(),
            missing_warned: Mutex::new(HashSet::new()),
        })
    }

    /// Decode one datagram, emitting events through the sink in wire order.
    pub fn decode(
        &self,
        payload: &[u8],
        host: &str,
        sink: &mut dyn FnMut(DateTime<Utc>, FlowEvent),
    ) {
        protocols::decode_datagram(self, payload, host, sink);
    }

    /// Rewrite the IPFIX template cache file to reflect current live
    /// templates. A no-op when persistence is not configured.
    pub fn persist_templates(&self) -> Result<(), PersistError> {
        self.ipfix_templates.persist()
    }

    /// Counters accumulated since construction.
    pub fn stats(&self) -> DecoderStats {
        self.stats.snapshot()
    }

    pub(crate) fn record_decoder(&self) -> RecordDecoder<'_> {
        RecordDecoder {
            switched_times_from_uptime: self.config.switched_times_from_uptime,
            include_flowset_id: self.config.include_flowset_id,
            samplers: &self.samplers,
        }
    }

    /// Warn about a data flowset with no template, once per key. The warning
    /// re-arms when a replacement template registers.
    pub(crate) fn warn_missing_template(&self, key: &TemplateKey) {
        let mut warned = self.missing_warned.lock().unwrap();
        if warned.insert(key.clone()) {
            warn!(
                message = "No template for data flowset, dropping flowset.",
                %key,
            );
            self.stats.record_missing_template_warning();
        }
    }

    pub(crate) fn clear_missing_warning(&self, key: &TemplateKey) {
        self.missing_warned.lock().unwrap().remove(key);
    }
}

/// Internal counters; relaxed ordering is enough for monitoring.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    templates_registered: AtomicU64,
    records_decoded: AtomicU64,
    missing_template_warnings: AtomicU64,
    datagrams_dropped: AtomicU64,
}

impl StatsInner {
    pub(crate) fn record_registered_template(&self) {
        self.templates_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_records_decoded(&self, n: u64) {
        self.records_decoded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_missing_template_warning(&self) {
        self.missing_template_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_datagram(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DecoderStats {
        DecoderStats {
            templates_registered: self.templates_registered.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            missing_template_warnings: self.missing_template_warnings.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the decoder's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub templates_registered: u64,
    pub records_decoded: u64,
    pub missing_template_warnings: u64,
    pub datagrams_dropped: u64,
}
