//! Telemetry frame encoding (§6.6).
//!
//! The core only produces the binary frame; the WebSocket server that pushes
//! it to clients is the outbound collaborator and is out of scope (§1).
//! Subscription resolution against a segment's directory (exact name,
//! `module.*`, or `*`) lives here because it only needs the directory, not
//! a socket.
use crate::segment::BackplaneSegment;

pub const MAGIC: u32 = 0x4845_5254; // "HERT" little-endian

/// A subscription pattern: an exact qualified name, `module.*`, or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Exact(String),
    ModuleWildcard(String),
    All,
}

impl Subscription {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Subscription::All
        } else if let Some(module) = pattern.strip_suffix(".*") {
            Subscription::ModuleWildcard(module.to_string())
        } else {
            Subscription::Exact(pattern.to_string())
        }
    }

    fn matches(&self, qualified_name: &str) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Exact(name) => name == qualified_name,
            Subscription::ModuleWildcard(module) => qualified_name
                .split_once('.')
                .map(|(m, _)| m == module)
                .unwrap_or(false),
        }
    }
}

/// Resolves a set of subscription patterns against `segment`'s directory,
/// in directory (slot) order, deduplicated.
pub fn resolve_subscriptions(segment: &BackplaneSegment, patterns: &[Subscription]) -> Vec<String> {
    segment
        .directory()
        .into_iter()
        .filter(|entry| patterns.iter().any(|p| p.matches(&entry.name)))
        .map(|entry| entry.name)
        .collect()
}

/// Encodes one telemetry frame for the signals named in `names`, in that
/// order, reading current values from `segment`.
pub fn encode_frame(segment: &BackplaneSegment, names: &[String]) -> Vec<u8> {
    let frame = segment.get_frame();
    let time_s = segment.get_time_ns() as f64 / 1e9;
    let count = names.len() as u32;

    let mut buf = Vec::with_capacity(24 + names.len() * 8);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&frame.to_le_bytes());
    buf.extend_from_slice(&time_s.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for name in names {
        let value = segment.get_f64(name).unwrap_or(f64::NAN);
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{build_registry, DataType, SignalDescriptor};
    use crate::segment::SignalValue;

    fn descriptor(name: &str) -> SignalDescriptor {
        SignalDescriptor {
            name: name.into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable: true,
            published: true,
        }
    }

    #[test]
    fn wildcard_subscription_matches_module_prefix() {
        let a_x = descriptor("x");
        let b_y = descriptor("y");
        let signals = build_registry([("a", &a_x), ("b", &b_y)]).unwrap();

        let name = format!("/hermes-test-telemetry-{}", std::process::id());
        let mut seg = crate::segment::BackplaneSegment::create(&name, &signals).unwrap();
        seg.set_value("a.x", SignalValue::F64(1.0)).unwrap();
        seg.set_value("b.y", SignalValue::F64(2.0)).unwrap();
        seg.set_frame(5).unwrap();
        seg.set_time_ns(50_000_000).unwrap();

        let subs = vec![Subscription::parse("a.*")];
        let resolved = resolve_subscriptions(&seg, &subs);
        assert_eq!(resolved, vec!["a.x".to_string()]);

        let frame = encode_frame(&seg, &resolved);
        assert_eq!(&frame[0..4], &MAGIC.to_le_bytes());
        assert_eq!(u64::from_le_bytes(frame[4..12].try_into().unwrap()), 5);
        assert_eq!(
            f64::from_le_bytes(frame[12..20].try_into().unwrap()),
            0.05
        );
        assert_eq!(u32::from_le_bytes(frame[20..24].try_into().unwrap()), 1);
        assert_eq!(
            f64::from_le_bytes(frame[24..32].try_into().unwrap()),
            1.0
        );

        seg.destroy();
    }
}
