//! Signal registry & segment builder inputs (§4.3).
//!
//! This is a stateless set of helpers: given the config's flat list of
//! `(module_name, local_signal_descriptor)` tuples, produce the ordered slot
//! list that is fed into [crate::segment::BackplaneSegment::create]. The order
//! of slots is the concatenation of modules' declared signals in configured
//! module order, and within a module, declaration order. This order is an
//! ABI between coordinator and module processes, since both sides compute it
//! from the same config.
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};

/// The maximum length, in bytes, of a qualified signal name.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F64,
    F32,
    I64,
    I32,
    Bool,
}

impl DataType {
    /// Number of meaningful bytes for this type. Every slot reserves a full
    /// 8-byte, naturally-aligned stride regardless of this value (§4.1); this
    /// is how many of those bytes are interpreted by type-exact access.
    pub fn width(&self) -> usize {
        match self {
            DataType::F64 | DataType::I64 => 8,
            DataType::F32 | DataType::I32 => 4,
            DataType::Bool => 1,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            DataType::F64 => 0,
            DataType::F32 => 1,
            DataType::I64 => 2,
            DataType::I32 => 3,
            DataType::Bool => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> HermesResult<Self> {
        Ok(match tag {
            0 => DataType::F64,
            1 => DataType::F32,
            2 => DataType::I64,
            3 => DataType::I32,
            4 => DataType::Bool,
            _ => return Err(anyhow!("unknown data type tag {tag}")).typ(HermesErrorKind::Panic),
        })
    }
}

/// Per-slot flags (§3.1). `writable` permits `set_signal`/wire destinations;
/// `published` marks a signal as eligible for telemetry subscriptions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalFlags {
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub published: bool,
}

/// A signal as declared in config, before it is assigned a slot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub published: bool,
}

/// A signal bound to a slot index, ready to be written into the segment
/// directory. This is the registry's sole output.
#[derive(Debug, Clone)]
pub struct ResolvedSignal {
    pub qualified_name: String,
    pub data_type: DataType,
    pub flags: SignalFlags,
}

/// Validates a qualified or local signal name per §4.3: non-empty, at most
/// [MAX_NAME_LEN] bytes, ASCII-printable, no NUL or whitespace.
pub fn validate_name(name: &str) -> HermesResult<()> {
    if name.is_empty() {
        return Err(anyhow!("signal name must not be empty")).typ(HermesErrorKind::Config);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(anyhow!(
            "signal name {name:?} exceeds {MAX_NAME_LEN} bytes"
        ))
        .typ(HermesErrorKind::Config);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_graphic() || c == '.')
    {
        return Err(anyhow!(
            "signal name {name:?} must be ASCII-printable without whitespace or NUL"
        ))
        .typ(HermesErrorKind::Config);
    }
    Ok(())
}

/// Builds the ordered, slot-resolved signal list from a flat
/// `(module_name, descriptor)` stream in configured module/declaration order.
///
/// Enforces qualified-name uniqueness (§8.1 invariant 6).
pub fn build_registry<'a, I>(modules: I) -> HermesResult<Vec<ResolvedSignal>>
where
    I: IntoIterator<Item = (&'a str, &'a SignalDescriptor)>,
{
    let mut seen = std::collections::HashSet::new();
    let mut resolved = Vec::new();

    for (module_name, descriptor) in modules {
        validate_name(module_name)?;
        validate_name(&descriptor.name)?;

        let qualified_name = format!("{module_name}.{}", descriptor.name);
        validate_name(&qualified_name)?;

        if !seen.insert(qualified_name.clone()) {
            return Err(anyhow!("duplicate qualified signal name {qualified_name:?}"))
                .typ(HermesErrorKind::Config);
        }

        resolved.push(ResolvedSignal {
            qualified_name,
            data_type: descriptor.data_type,
            flags: SignalFlags {
                writable: descriptor.writable,
                published: descriptor.published,
            },
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, writable: bool) -> SignalDescriptor {
        SignalDescriptor {
            name: name.into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable,
            published: true,
        }
    }

    #[test]
    fn orders_slots_by_module_then_declaration() {
        let a_x = descriptor("x", true);
        let a_y = descriptor("y", true);
        let b_z = descriptor("z", true);
        let resolved = build_registry([("a", &a_x), ("a", &a_y), ("b", &b_z)]).unwrap();
        let names: Vec<_> = resolved.iter().map(|s| s.qualified_name.clone()).collect();
        assert_eq!(names, vec!["a.x", "a.y", "b.z"]);
    }

    #[test]
    fn rejects_duplicate_qualified_names() {
        let x1 = descriptor("x", true);
        let x2 = descriptor("x", true);
        let err = build_registry([("a", &x1), ("a", &x2)]).unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::Config);
    }

    #[test]
    fn rejects_names_with_whitespace() {
        assert!(validate_name("has space").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("a.b").is_ok());
    }
}
