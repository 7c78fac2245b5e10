// instruction.rs — Instruction descriptors: metadata for every traced call
//
// Declares the schedule's instructions (lookups, rewrites, sampling and
// markers), the handle kinds they consume and produce, and their literal
// attributes. The trace uses the table to validate records before replay
// and to render them; the certificate trait shared by verification passes
// lives here as well.

use serde::{Deserialize, Serialize};

// ── Certificates ───────────────────────────────────────────────────────────

/// A set of named proof obligations produced by a verification pass.
pub trait StageCert {
    fn all_pass(&self) -> bool;
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Instruction identifiers ────────────────────────────────────────────────

/// Identifies each traced instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstKind {
    GetBlock,
    GetLoops,
    GetChildBlocks,
    GetProducers,
    GetConsumers,
    Split,
    Fuse,
    Reorder,
    Parallel,
    Vectorize,
    Bind,
    Unroll,
    CacheRead,
    CacheWrite,
    ComputeAt,
    ReverseComputeAt,
    ComputeInline,
    ReverseComputeInline,
    DecomposeReduction,
    #[serde(rename = "rfactor")]
    RFactor,
    StorageAlign,
    SetScope,
    SampleCategorical,
    SamplePerfectTile,
    EnterPostproc,
}

/// Kind of a handle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RvKind {
    Loop,
    Block,
    Expr,
    /// A loop or a block.
    Stmt,
    /// An expression handle, a literal integer, or nothing.
    Factor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Lookup,
    LoopTransform,
    ForKind,
    CacheStage,
    ComputeLocation,
    Inline,
    Reduction,
    Annotation,
    Sampling,
    Marker,
}

// ── Descriptor ─────────────────────────────────────────────────────────────

/// Static metadata about an instruction.
pub struct InstructionDescriptor {
    /// Name used in traces and rendered listings.
    pub name: &'static str,
    pub category: Category,
    /// Input handle kinds, in order. With `variadic_inputs`, the last kind
    /// repeats zero or more times.
    pub inputs: &'static [RvKind],
    pub variadic_inputs: bool,
    /// Names of literal attributes, in order.
    pub attrs: &'static [&'static str],
    /// Output handle kinds. With `variadic_outputs`, the single kind repeats.
    pub outputs: &'static [RvKind],
    pub variadic_outputs: bool,
    /// True if the record carries a sampling decision.
    pub has_decision: bool,
}

fn desc(
    name: &'static str,
    category: Category,
    inputs: &'static [RvKind],
    variadic_inputs: bool,
    attrs: &'static [&'static str],
    outputs: &'static [RvKind],
    variadic_outputs: bool,
) -> InstructionDescriptor {
    InstructionDescriptor {
        name,
        category,
        inputs,
        variadic_inputs,
        attrs,
        outputs,
        variadic_outputs,
        has_decision: false,
    }
}

/// Return the static descriptor for an instruction.
pub fn descriptor(kind: InstKind) -> InstructionDescriptor {
    use crate::instruction::Category as C;
    use crate::instruction::RvKind::*;
    let d = desc;
    match kind {
        InstKind::GetBlock => d("get_block", C::Lookup, &[], false, &["name"], &[Block], false),
        InstKind::GetLoops => d("get_loops", C::Lookup, &[Block], false, &[], &[Loop], true),
        InstKind::GetChildBlocks => {
            d("get_child_blocks", C::Lookup, &[Stmt], false, &[], &[Block], true)
        }
        InstKind::GetProducers => {
            d("get_producers", C::Lookup, &[Block], false, &[], &[Block], true)
        }
        InstKind::GetConsumers => {
            d("get_consumers", C::Lookup, &[Block], false, &[], &[Block], true)
        }
        InstKind::Split => d("split", C::LoopTransform, &[Loop, Factor], true, &[], &[Loop], true),
        InstKind::Fuse => d("fuse", C::LoopTransform, &[Loop], true, &[], &[Loop], false),
        InstKind::Reorder => d("reorder", C::LoopTransform, &[Loop], true, &[], &[], false),
        InstKind::Parallel => d("parallel", C::ForKind, &[Loop], false, &[], &[], false),
        InstKind::Vectorize => d("vectorize", C::ForKind, &[Loop], false, &[], &[], false),
        InstKind::Bind => d("bind", C::ForKind, &[Loop], false, &["thread_axis"], &[], false),
        InstKind::Unroll => d("unroll", C::ForKind, &[Loop], false, &[], &[], false),
        InstKind::CacheRead => d(
            "cache_read",
            C::CacheStage,
            &[Block],
            false,
            &["read_buffer_index", "storage_scope"],
            &[Block],
            false,
        ),
        InstKind::CacheWrite => d(
            "cache_write",
            C::CacheStage,
            &[Block],
            false,
            &["write_buffer_index", "storage_scope"],
            &[Block],
            false,
        ),
        InstKind::ComputeAt => d(
            "compute_at",
            C::ComputeLocation,
            &[Block, Loop],
            false,
            &["preserve_unit_loops"],
            &[],
            false,
        ),
        InstKind::ReverseComputeAt => d(
            "reverse_compute_at",
            C::ComputeLocation,
            &[Block, Loop],
            false,
            &["preserve_unit_loops"],
            &[],
            false,
        ),
        InstKind::ComputeInline => d("compute_inline", C::Inline, &[Block], false, &[], &[], false),
        InstKind::ReverseComputeInline => {
            d("reverse_compute_inline", C::Inline, &[Block], false, &[], &[], false)
        }
        InstKind::DecomposeReduction => d(
            "decompose_reduction",
            C::Reduction,
            &[Block, Loop],
            false,
            &[],
            &[Block],
            false,
        ),
        InstKind::RFactor => d("rfactor", C::Reduction, &[Loop], false, &["factor_axis"], &[Block], false),
        InstKind::StorageAlign => d(
            "storage_align",
            C::Annotation,
            &[Block],
            false,
            &["buffer_index", "axis", "factor", "offset"],
            &[],
            false,
        ),
        InstKind::SetScope => d(
            "set_scope",
            C::Annotation,
            &[Block],
            false,
            &["buffer_index", "storage_scope"],
            &[],
            false,
        ),
        InstKind::SampleCategorical => InstructionDescriptor {
            has_decision: true,
            ..d("sample_categorical", C::Sampling, &[], false, &["candidates", "probs"], &[Expr], false)
        },
        InstKind::SamplePerfectTile => InstructionDescriptor {
            has_decision: true,
            ..d(
                "sample_perfect_tile",
                C::Sampling,
                &[Loop],
                false,
                &["n", "max_innermost_factor"],
                &[Expr],
                true,
            )
        },
        InstKind::EnterPostproc => d("enter_postproc", C::Marker, &[], false, &[], &[], false),
    }
}

/// Every instruction in declaration order.
pub const ALL_INSTRUCTIONS: [InstKind; 25] = [
    InstKind::GetBlock,
    InstKind::GetLoops,
    InstKind::GetChildBlocks,
    InstKind::GetProducers,
    InstKind::GetConsumers,
    InstKind::Split,
    InstKind::Fuse,
    InstKind::Reorder,
    InstKind::Parallel,
    InstKind::Vectorize,
    InstKind::Bind,
    InstKind::Unroll,
    InstKind::CacheRead,
    InstKind::CacheWrite,
    InstKind::ComputeAt,
    InstKind::ReverseComputeAt,
    InstKind::ComputeInline,
    InstKind::ReverseComputeInline,
    InstKind::DecomposeReduction,
    InstKind::RFactor,
    InstKind::StorageAlign,
    InstKind::SetScope,
    InstKind::SampleCategorical,
    InstKind::SamplePerfectTile,
    InstKind::EnterPostproc,
];

impl InstructionDescriptor {
    /// Whether `n` inputs satisfy this descriptor's arity.
    pub fn accepts_inputs(&self, n: usize) -> bool {
        if self.variadic_inputs {
            n + 1 >= self.inputs.len()
        } else {
            n == self.inputs.len()
        }
    }

    /// Whether `n` outputs satisfy this descriptor's arity.
    pub fn accepts_outputs(&self, n: usize) -> bool {
        if self.variadic_outputs {
            true
        } else {
            n == self.outputs.len()
        }
    }

    /// Expected kind of input position `i`.
    pub fn input_kind(&self, i: usize) -> Option<RvKind> {
        match self.inputs.get(i) {
            Some(k) => Some(*k),
            None if self.variadic_inputs => self.inputs.last().copied(),
            None => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let names: HashSet<&str> = ALL_INSTRUCTIONS.iter().map(|k| descriptor(*k).name).collect();
        assert_eq!(names.len(), ALL_INSTRUCTIONS.len());
    }

    #[test]
    fn serde_name_matches_descriptor() {
        for kind in ALL_INSTRUCTIONS {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", descriptor(kind).name));
        }
    }

    #[test]
    fn only_samplers_carry_decisions() {
        for kind in ALL_INSTRUCTIONS {
            let d = descriptor(kind);
            assert_eq!(d.has_decision, d.category == Category::Sampling, "{}", d.name);
        }
    }

    #[test]
    fn variadic_arity() {
        let split = descriptor(InstKind::Split);
        assert!(split.accepts_inputs(1));
        assert!(split.accepts_inputs(4));
        assert_eq!(split.input_kind(3), Some(RvKind::Factor));
        let bind = descriptor(InstKind::Bind);
        assert!(!bind.accepts_inputs(2));
        assert!(bind.accepts_outputs(0));
    }
}
