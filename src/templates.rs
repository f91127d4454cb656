//! Template cache keyed by exporter identity.
//!
//! Templates arrive in template flowsets and describe the layout of later
//! data flowsets. The registry resolves raw field triples through the field
//! dictionary, caches the result with a TTL, and (for IPFIX) persists the raw
//! triples to disk so templates survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::fields::{FieldDictionary, ResolvedField};

/// Errors raised while persisting the template cache. The in-memory registry
/// keeps working when these occur.
#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("failed to write template cache {}: {}", path.display(), source))]
    WriteCache {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode template cache: {}", source))]
    EncodeCache { source: serde_json::Error },
}

/// One raw field as carried by a template record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField {
    pub field_type: u16,
    pub field_length: u16,
    /// IANA enterprise number; 0 for standard fields.
    pub enterprise_id: u32,
    /// Resolve through the v9 `scope` category instead of `option`.
    pub scope: bool,
}

impl RawField {
    pub fn new(field_type: u16, field_length: u16, enterprise_id: u32) -> Self {
        Self {
            field_type,
            field_length,
            enterprise_id,
            scope: false,
        }
    }

    pub fn scoped(field_type: u16, field_length: u16) -> Self {
        Self {
            field_type,
            field_length,
            enterprise_id: 0,
            scope: true,
        }
    }
}

/// Identity of a template inside the cache.
///
/// NetFlow v9 keys carry the sending host and the header `source_id`; IPFIX
/// keys carry the observation domain id from the header, and the host is
/// optional because the exporter identity is already in the PDU.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub host: Option<String>,
    pub domain: u32,
    pub template_id: u16,
}

impl TemplateKey {
    pub fn v9(host: &str, source_id: u32, template_id: u16) -> Self {
        Self {
            host: Some(host.to_owned()),
            domain: source_id,
            template_id,
        }
    }

    pub fn ipfix(observation_domain_id: u32, template_id: u16) -> Self {
        Self {
            host: None,
            domain: observation_domain_id,
            template_id,
        }
    }

    /// String form used only in the persisted JSON file.
    fn to_cache_string(&self) -> String {
        match &self.host {
            Some(host) => format!("{}|{}|{}", host, self.domain, self.template_id),
            None => format!("{}|{}", self.domain, self.template_id),
        }
    }

    fn from_cache_string(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('|').collect();
        match parts.as_slice() {
            [domain, template_id] => Some(Self {
                host: None,
                domain: domain.parse().ok()?,
                template_id: template_id.parse().ok()?,
            }),
            [host, domain, template_id] => Some(Self {
                host: Some((*host).to_owned()),
                domain: domain.parse().ok()?,
                template_id: template_id.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_cache_string())
    }
}

/// A resolved template: ordered field specs plus the raw triples they came
/// from. Never mutated after construction; replacement in the cache is
/// atomic.
#[derive(Debug)]
pub struct Template {
    fields: Vec<ResolvedField>,
    raw: Vec<RawField>,
    fixed_width: Option<usize>,
}

impl Template {
    /// Resolve every raw field through the dictionary. Partial resolution
    /// yields `None` and nothing may be cached.
    fn resolve(raw: &[RawField], dictionary: &FieldDictionary) -> Option<Self> {
        let mut fields = Vec::with_capacity(raw.len());
        for field in raw {
            fields.push(dictionary.resolve(
                field.field_type,
                field.field_length,
                field.enterprise_id,
                field.scope,
            )?);
        }

        let fixed_width = fields
            .iter()
            .map(|f| f.spec.fixed_len())
            .try_fold(0usize, |acc, len| len.map(|l| acc + l));

        Some(Self {
            fields,
            raw: raw.to_vec(),
            fixed_width,
        })
    }

    pub fn fields(&self) -> &[ResolvedField] {
        &self.fields
    }

    pub fn raw_fields(&self) -> &[RawField] {
        &self.raw
    }

    /// Byte width of one record when every field is fixed-length, `None`
    /// when the layout contains variable-length fields.
    pub fn fixed_width(&self) -> Option<usize> {
        self.fixed_width
    }
}

struct CacheEntry {
    template: Arc<Template>,
    expires_at: Instant,
}

/// Time-expiring template cache.
///
/// A single mutex guards both the in-memory map and the cache file, so no
/// reader ever observes a partial update.
pub struct TemplateRegistry {
    ttl: Duration,
    dictionary: Arc<FieldDictionary>,
    cache_file: Option<PathBuf>,
    inner: Mutex<HashMap<TemplateKey, CacheEntry>>,
}

impl TemplateRegistry {
    /// Create a registry. If `cache_file` exists its contents are loaded and
    /// re-registered through the resolver; an unreadable file is logged and
    /// ignored.
    pub fn new(
        ttl: Duration,
        dictionary: Arc<FieldDictionary>,
        cache_file: Option<PathBuf>,
    ) -> Self {
        let registry = Self {
            ttl,
            dictionary,
            cache_file,
            inner: Mutex::new(HashMap::new()),
        };
        registry.do_load();
        registry
    }

    /// Load persisted templates, if any.
    fn do_load(&self) {
        let path = match &self.cache_file {
            Some(path) if path.exists() => path.clone(),
            _ => return,
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    message = "Failed to read template cache file, starting empty.",
                    path = %path.display(),
                    %error,
                );
                return;
            }
        };

        let entries: BTreeMap<String, Vec<(u16, u16, u32)>> = match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    message = "Template cache file is corrupt, starting empty.",
                    path = %path.display(),
                    %error,
                );
                return;
            }
        };

        let now = Instant::now();
        let mut loaded = 0usize;
        for (key, triples) in entries {
            let key = match TemplateKey::from_cache_string(&key) {
                Some(key) => key,
                None => {
                    warn!(message = "Skipping malformed template cache key.", %key);
                    continue;
                }
            };
            let raw: Vec<RawField> = triples
                .into_iter()
                .map(|(field_type, field_length, enterprise_id)| {
                    RawField::new(field_type, field_length, enterprise_id)
                })
                .collect();
            if self.register_at(now, key, &raw, None).is_some() {
                loaded += 1;
            }
        }
        debug!(message = "Loaded persisted templates.", count = loaded, path = %path.display());
    }

    /// Resolve and cache a template.
    ///
    /// The validator, when supplied, sees the resolved candidate; returning
    /// `false` rejects it, and a rejected template is neither cached nor
    /// persisted. Returns the resolved template on success.
    pub fn register(
        &self,
        key: TemplateKey,
        raw_fields: &[RawField],
        validator: Option<&dyn Fn(&Template) -> bool>,
    ) -> Option<Arc<Template>> {
        let template = self.register_at(Instant::now(), key, raw_fields, validator)?;
        if self.cache_file.is_some() {
            let guard = self.inner.lock().unwrap();
            if let Err(error) = self.persist_locked(&guard, Instant::now()) {
                warn!(message = "Failed to persist template cache.", %error);
            }
        }
        Some(template)
    }

    pub(crate) fn register_at(
        &self,
        now: Instant,
        key: TemplateKey,
        raw_fields: &[RawField],
        validator: Option<&dyn Fn(&Template) -> bool>,
    ) -> Option<Arc<Template>> {
        let template = match Template::resolve(raw_fields, &self.dictionary) {
            Some(template) => Arc::new(template),
            None => {
                warn!(message = "Template did not resolve, not caching.", %key);
                return None;
            }
        };

        if let Some(validator) = validator {
            if !validator(&template) {
                debug!(message = "Validator rejected template, not caching.", %key);
                return None;
            }
        }

        let mut guard = self.inner.lock().unwrap();
        guard.retain(|_, entry| entry.expires_at > now);
        guard.insert(
            key,
            CacheEntry {
                template: Arc::clone(&template),
                expires_at: now + self.ttl,
            },
        );
        Some(template)
    }

    /// Fetch a live template; absent or expired entries yield `None`.
    pub fn fetch(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        self.fetch_at(Instant::now(), key)
    }

    pub(crate) fn fetch_at(&self, now: Instant, key: &TemplateKey) -> Option<Arc<Template>> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Rewrite the cache file to reflect the current live entries.
    pub fn persist(&self) -> Result<(), PersistError> {
        let now = Instant::now();
        let mut guard = self.inner.lock().unwrap();
        guard.retain(|_, entry| entry.expires_at > now);
        self.persist_locked(&guard, now)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().unwrap();
        guard
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write live entries to the cache file, atomically replacing it. Called
    /// with the map lock held so readers never see a partial file.
    fn persist_locked(
        &self,
        entries: &MutexGuard<'_, HashMap<TemplateKey, CacheEntry>>,
        now: Instant,
    ) -> Result<(), PersistError> {
        let path = match &self.cache_file {
            Some(path) => path,
            None => return Ok(()),
        };

        let snapshot: BTreeMap<String, Vec<(u16, u16, u32)>> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| {
                let triples = entry
                    .template
                    .raw_fields()
                    .iter()
                    .map(|f| (f.field_type, f.field_length, f.enterprise_id))
                    .collect();
                (key.to_cache_string(), triples)
            })
            .collect();

        let encoded = serde_json::to_string(&snapshot).context(EncodeCacheSnafu)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded).context(WriteCacheSnafu { path: tmp.clone() })?;
        std::fs::rename(&tmp, path).context(WriteCacheSnafu { path: path.clone() })?;
        Ok(())
    }
}
