//! The wire router (§4.7): `dst = src * gain + offset`, applied once per
//! frame after every scheduled module has reported done.
//!
//! Wires are compiled once, at coordinator startup, into slot indices so
//! that routing a frame never resolves a name or allocates.
use serde::{Deserialize, Serialize};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};
use crate::segment::BackplaneSegment;

/// A wire as declared in config: `dst = src * gain + offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wire {
    pub src: String,
    pub dst: String,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_gain() -> f64 {
    1.0
}

struct CompiledWire {
    src_slot: usize,
    dst_slot: usize,
    gain: f64,
    offset: f64,
}

/// A compiled set of wires, ready to be applied against a segment every
/// frame without further name resolution.
pub struct WireRouter {
    wires: Vec<CompiledWire>,
}

impl WireRouter {
    /// Resolves every wire's endpoints against `segment`, in declaration
    /// order. Fails with [HermesErrorKind::NotWritable] if a destination is
    /// not writable, per §4.7.
    pub fn compile(wires: &[Wire], segment: &BackplaneSegment) -> HermesResult<Self> {
        let mut compiled = Vec::with_capacity(wires.len());
        for wire in wires {
            let src_slot = segment.slot_of(&wire.src)?;
            let dst_slot = segment.slot_of(&wire.dst)?;
            if !segment.is_writable(dst_slot) {
                return Err(anyhow::anyhow!(
                    "wire destination {:?} is not writable",
                    wire.dst
                ))
                .typ(HermesErrorKind::NotWritable);
            }
            compiled.push(CompiledWire {
                src_slot,
                dst_slot,
                gain: wire.gain,
                offset: wire.offset,
            });
        }
        Ok(Self { wires: compiled })
    }

    /// Applies every wire in declaration order: reads each source, computes
    /// `src * gain + offset`, and writes the result narrowed into the
    /// destination's declared type.
    pub fn route(&self, segment: &BackplaneSegment) {
        for wire in &self.wires {
            let src_value = segment.get_value_by_slot(wire.src_slot).as_f64();
            let routed = src_value * wire.gain + wire.offset;
            let dst_type = segment.get_value_by_slot(wire.dst_slot).data_type();
            segment.set_value_unchecked(wire.dst_slot, crate::segment::SignalValue::from_f64(dst_type, routed));
        }
    }

    pub fn len(&self) -> usize {
        self.wires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wires.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{build_registry, DataType, SignalDescriptor};
    use crate::segment::{BackplaneSegment, SignalValue};

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
    fn routes_gain_and_offset() {
        let src = descriptor("src", true);
        let dst = descriptor("dst", true);
        let signals = build_registry([("a", &src), ("a", &dst)]).unwrap();

        let name = format!("/hermes-test-wire-{}", std::process::id());
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();
        seg.set_value("a.src", SignalValue::F64(2.0)).unwrap();

        let wires = vec![Wire {
            src: "a.src".into(),
            dst: "a.dst".into(),
            gain: 3.0,
            offset: 1.0,
        }];
        let router = WireRouter::compile(&wires, &seg).unwrap();
        router.route(&seg);

        assert_eq!(seg.get_f64("a.dst").unwrap(), 7.0);
        seg.destroy();
    }

    #[test]
    fn rejects_non_writable_destination() {
        let src = descriptor("src", true);
        let dst = descriptor("dst", false);
        let signals = build_registry([("a", &src), ("a", &dst)]).unwrap();

        let name = format!("/hermes-test-wire-ro-{}", std::process::id());
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();

        let wires = vec![Wire {
            src: "a.src".into(),
            dst: "a.dst".into(),
            gain: 1.0,
            offset: 0.0,
        }];
        let err = WireRouter::compile(&wires, &seg).unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::NotWritable);

        seg.destroy();
    }
}
