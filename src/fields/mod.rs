//! Field dictionaries and binary field specs.
//!
//! Dictionaries map `(enterprise_id, field_id)` to a field definition loaded
//! from YAML. The layout resolver turns the raw `(type, length, enterprise)`
//! triples carried by template records into concrete [`FieldSpec`]s that the
//! record decoder can interpret over raw bytes.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::Deserialize;
use snafu::ResultExt;
use tracing::warn;

use crate::config::{ConfigError, ParseDefinitionsSnafu, ReadDefinitionsSnafu};
use crate::event::Value;

const NETFLOW_V9_DEFINITIONS: &str = include_str!("netflow.yaml");
const IPFIX_DEFINITIONS: &str = include_str!("ipfix.yaml");

/// Sentinel wire length marking a variable-length field (RFC 7011 §7).
pub const VARIABLE_LENGTH: u16 = 0xFFFF;

/// Semantic field types as spelled in the YAML dictionaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Ipv4Addr,
    Ipv6Addr,
    MacAddr,
    String,
    Skip,
    #[serde(rename = "octetarray")]
    OctetArray,
    ApplicationId,
}

/// One dictionary entry, in either of the two YAML shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldDef {
    /// `[type_atom, name]`
    Typed(FieldKind, String),
    /// `[default_byte_length, name]`: an unsigned integer whose width is
    /// taken from the wire, falling back to the given width when the wire
    /// length is zero.
    Sized(u16, String),
}

impl FieldDef {
    pub fn name(&self) -> &str {
        match self {
            FieldDef::Typed(_, name) | FieldDef::Sized(_, name) => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NetflowV9Definitions {
    scope: BTreeMap<u16, FieldDef>,
    option: BTreeMap<u16, FieldDef>,
}

/// Immutable field dictionary for one protocol, shared across threads.
#[derive(Debug)]
pub struct FieldDictionary {
    /// `(enterprise_id, field_id)` to definition; NetFlow v9 entries all
    /// live under enterprise 0.
    options: HashMap<(u32, u16), FieldDef>,
    /// NetFlow v9 `scope` category; empty for IPFIX.
    scopes: HashMap<u16, FieldDef>,
}

impl FieldDictionary {
    /// Build the NetFlow v9 dictionary, optionally merging a user-supplied
    /// file into the `option` category.
    pub fn netflow_v9(extra: Option<&Path>) -> Result<Self, ConfigError> {
        let defs: NetflowV9Definitions = serde_yaml::from_str(NETFLOW_V9_DEFINITIONS)
            .context(ParseDefinitionsSnafu { name: "netflow.yaml" })?;

        let mut options: HashMap<(u32, u16), FieldDef> = defs
            .option
            .into_iter()
            .map(|(id, def)| ((0, id), def))
            .collect();
        let scopes = defs.scope.into_iter().collect();

        if let Some(path) = extra {
            let text = std::fs::read_to_string(path).context(ReadDefinitionsSnafu { path })?;
            let merged: BTreeMap<u16, FieldDef> =
                serde_yaml::from_str(&text).context(ParseDefinitionsSnafu {
                    name: path.display().to_string(),
                })?;
            options.extend(merged.into_iter().map(|(id, def)| ((0, id), def)));
        }

        Ok(Self { options, scopes })
    }

    /// Build the IPFIX dictionary, optionally merging a user-supplied file.
    /// The user file carries its own enterprise keys; entries overwrite the
    /// built-ins on collision.
    pub fn ipfix(extra: Option<&Path>) -> Result<Self, ConfigError> {
        let defs: BTreeMap<u32, BTreeMap<u16, FieldDef>> =
            serde_yaml::from_str(IPFIX_DEFINITIONS)
                .context(ParseDefinitionsSnafu { name: "ipfix.yaml" })?;

        let mut options: HashMap<(u32, u16), FieldDef> = defs
            .into_iter()
            .flat_map(|(enterprise, fields)| {
                fields
                    .into_iter()
                    .map(move |(id, def)| ((enterprise, id), def))
            })
            .collect();

        if let Some(path) = extra {
            let text = std::fs::read_to_string(path).context(ReadDefinitionsSnafu { path })?;
            let merged: BTreeMap<u32, BTreeMap<u16, FieldDef>> =
                serde_yaml::from_str(&text).context(ParseDefinitionsSnafu {
                    name: path.display().to_string(),
                })?;
            for (enterprise, fields) in merged {
                for (id, def) in fields {
                    options.insert((enterprise, id), def);
                }
            }
        }

        Ok(Self {
            options,
            scopes: HashMap::new(),
        })
    }

    pub fn lookup(&self, enterprise_id: u32, field_id: u16) -> Option<&FieldDef> {
        self.options.get(&(enterprise_id, field_id))
    }

    pub fn lookup_scope(&self, field_id: u16) -> Option<&FieldDef> {
        self.scopes.get(&field_id)
    }

    /// Resolve one raw template field into a concrete spec.
    ///
    /// Returns `None` on a dictionary miss or an unrepresentable width; the
    /// caller must reject the enclosing template.
    pub fn resolve(
        &self,
        field_type: u16,
        wire_length: u16,
        enterprise_id: u32,
        scope: bool,
    ) -> Option<ResolvedField> {
        let def = if scope {
            self.lookup_scope(field_type)
        } else {
            self.lookup(enterprise_id, field_type)
        };
        let def = match def {
            Some(def) => def,
            None => {
                warn!(
                    message = "Unknown field in template, rejecting template.",
                    field_type,
                    enterprise_id,
                    length = wire_length,
                );
                return None;
            }
        };

        let name = def.name().to_owned();
        let spec = match *def {
            FieldDef::Typed(FieldKind::Skip, _) => {
                if wire_length == VARIABLE_LENGTH {
                    FieldSpec::VarSkip
                } else {
                    FieldSpec::Skip { len: wire_length }
                }
            }
            FieldDef::Typed(FieldKind::String, _) => {
                if wire_length == VARIABLE_LENGTH {
                    FieldSpec::VarString
                } else {
                    FieldSpec::String { len: wire_length }
                }
            }
            FieldDef::Typed(FieldKind::OctetArray, _) => {
                if wire_length == VARIABLE_LENGTH {
                    FieldSpec::VarOctetArray
                } else {
                    FieldSpec::OctetArray { len: wire_length }
                }
            }
            FieldDef::Typed(FieldKind::Uint8, _) => uint_spec(wire_length, 1)?,
            FieldDef::Typed(FieldKind::Uint16, _) => uint_spec(wire_length, 2)?,
            FieldDef::Typed(FieldKind::Uint32, _) => uint_spec(wire_length, 4)?,
            FieldDef::Typed(FieldKind::Uint64, _) => uint_spec(wire_length, 8)?,
            FieldDef::Typed(FieldKind::ApplicationId, _) => FieldSpec::ApplicationId {
                len: if wire_length > 0 && wire_length != VARIABLE_LENGTH {
                    wire_length
                } else {
                    4
                },
            },
            FieldDef::Typed(FieldKind::Ipv4Addr, _) => FieldSpec::Ipv4Addr,
            FieldDef::Typed(FieldKind::Ipv6Addr, _) => FieldSpec::Ipv6Addr,
            FieldDef::Typed(FieldKind::MacAddr, _) => FieldSpec::MacAddr,
            FieldDef::Sized(default_len, _) => uint_spec(wire_length, default_len)?,
        };

        Some(ResolvedField { name, spec })
    }
}

/// An unsigned integer spec whose width comes from the wire length, with a
/// dictionary fallback. Widths above 8 bytes do not fit a u64 and reject the
/// template.
fn uint_spec(wire_length: u16, default_len: u16) -> Option<FieldSpec> {
    let width = if wire_length > 0 && wire_length != VARIABLE_LENGTH {
        wire_length
    } else {
        default_len
    };
    if width == 0 || width > 8 {
        warn!(
            message = "Unrepresentable integer width in template, rejecting template.",
            width,
        );
        return None;
    }
    Some(FieldSpec::Uint { bytes: width as u8 })
}

/// How to read one field from a binary stream. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSpec {
    /// Big-endian unsigned integer of 1 to 8 bytes.
    Uint { bytes: u8 },
    /// Fixed-length string, right-padded; padding is trimmed.
    String { len: u16 },
    /// Length-prefixed string (sentinel wire length).
    VarString,
    /// Fixed number of bytes discarded.
    Skip { len: u16 },
    /// Length-prefixed discard.
    VarSkip,
    /// Fixed-length opaque bytes, rendered as lowercase hex.
    OctetArray { len: u16 },
    /// Length-prefixed opaque bytes.
    VarOctetArray,
    Ipv4Addr,
    Ipv6Addr,
    MacAddr,
    /// RFC 6759 composite: 1-byte classification engine id plus selector.
    ApplicationId { len: u16 },
}

impl FieldSpec {
    /// Byte width on the wire, `None` for variable-length specs.
    pub fn fixed_len(&self) -> Option<usize> {
        match *self {
            FieldSpec::Uint { bytes } => Some(bytes as usize),
            FieldSpec::String { len }
            | FieldSpec::Skip { len }
            | FieldSpec::OctetArray { len }
            | FieldSpec::ApplicationId { len } => Some(len as usize),
            FieldSpec::Ipv4Addr => Some(4),
            FieldSpec::Ipv6Addr => Some(16),
            FieldSpec::MacAddr => Some(6),
            FieldSpec::VarString | FieldSpec::VarSkip | FieldSpec::VarOctetArray => None,
        }
    }

    /// Read one value off the stream.
    pub(crate) fn read(&self, reader: &mut Reader<'_>) -> ReadOutcome {
        match *self {
            FieldSpec::Uint { bytes } => match reader.read_uint(bytes as usize) {
                Some(n) => ReadOutcome::Value(Value::UInt(n)),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::String { len } => match reader.take(len as usize) {
                Some(bytes) => ReadOutcome::Value(string_value(bytes)),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::VarString => match reader.take_var() {
                Some(bytes) => ReadOutcome::Value(string_value(bytes)),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::Skip { len } => match reader.take(len as usize) {
                Some(_) => ReadOutcome::Skipped,
                None => ReadOutcome::Truncated,
            },
            FieldSpec::VarSkip => match reader.take_var() {
                Some(_) => ReadOutcome::Skipped,
                None => ReadOutcome::Truncated,
            },
            FieldSpec::OctetArray { len } => match reader.take(len as usize) {
                Some(bytes) => ReadOutcome::Value(Value::String(hex_string(bytes))),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::VarOctetArray => match reader.take_var() {
                Some(bytes) => ReadOutcome::Value(Value::String(hex_string(bytes))),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::Ipv4Addr => match reader.take(4) {
                Some(b) => ReadOutcome::Value(Value::String(
                    Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string(),
                )),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::Ipv6Addr => match reader.take(16) {
                Some(b) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(b);
                    ReadOutcome::Value(Value::String(Ipv6Addr::from(octets).to_string()))
                }
                None => ReadOutcome::Truncated,
            },
            FieldSpec::MacAddr => match reader.take(6) {
                Some(b) => ReadOutcome::Value(Value::String(format!(
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    b[0], b[1], b[2], b[3], b[4], b[5]
                ))),
                None => ReadOutcome::Truncated,
            },
            FieldSpec::ApplicationId { len } => match reader.take(len as usize) {
                Some(b) if !b.is_empty() => {
                    let engine = b[0];
                    let selector = b[1..]
                        .iter()
                        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
                    ReadOutcome::Value(Value::String(format!("{}:{}", engine, selector)))
                }
                _ => ReadOutcome::Truncated,
            },
        }
    }
}

/// A field spec bound to its dictionary name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub name: String,
    pub spec: FieldSpec,
}

/// Result of reading a single field.
pub(crate) enum ReadOutcome {
    Value(Value),
    Skipped,
    Truncated,
}

fn string_value(bytes: &[u8]) -> Value {
    let trimmed: &[u8] = {
        let mut end = bytes.len();
        while end > 0 && (bytes[end - 1] == 0 || bytes[end - 1] == b' ') {
            end -= 1;
        }
        &bytes[..end]
    };
    Value::String(String::from_utf8_lossy(trimmed).into_owned())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Cursor over a record's bytes.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Big-endian unsigned integer of `n` bytes, `n` in 1..=8.
    pub(crate) fn read_uint(&mut self, n: usize) -> Option<u64> {
        let bytes = self.take(n)?;
        Some(
            bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        )
    }

    /// Variable-length field: 1-byte length, or 0xFF followed by a u16
    /// (RFC 7011 §7), then that many bytes.
    pub(crate) fn take_var(&mut self) -> Option<&'a [u8]> {
        let first = *self.take(1)?.first()?;
        let len = if first < 0xFF {
            first as usize
        } else {
            let bytes = self.take(2)?;
            u16::from_be_bytes([bytes[0], bytes[1]]) as usize
        };
        self.take(len)
    }
}
