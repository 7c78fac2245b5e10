// trace.rs — Append-only record of schedule calls, and its replayer
//
// Every schedule call appends one record: the instruction, its input
// handles, literal attributes, output handles and (for sampling) the resolved
// decision. Replaying the records against a fresh schedule over a
// structurally-equal program reproduces a structurally-equal result without
// drawing new randomness.
//
// Preconditions: records were produced by `Schedule` or deserialized from its
//                JSON form.
// Postconditions: `apply_to` either replays every record or stops at the
//                 first failing one.
// Failure modes: malformed records raise S0901; replayed primitives raise
//                their own codes.
// Side effects: `apply_to` mutates the target schedule.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::diag::{codes, ScheduleError, ScheduleResult};
use crate::id::{AnyRV, BlockRV, ExprRV, LoopRV};
use crate::instruction::{descriptor, InstKind, RvKind};
use crate::ir::Program;
use crate::rv::display_rv;
use crate::schedule::{Factor, Schedule, ScheduleConfig};

// ── Record parts ────────────────────────────────────────────────────────────

/// One input position of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Rv(AnyRV),
    Int(i64),
    None,
}

/// A literal attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
    Bool(bool),
    Int(i64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::Bool(b) => write!(f, "{}", b),
            Attr::Int(v) => write!(f, "{}", v),
            Attr::Str(s) => write!(f, "{:?}", s),
            Attr::Ints(vs) => write!(f, "{:?}", vs),
            Attr::Floats(vs) => write!(f, "{:?}", vs),
        }
    }
}

/// The value a sampling instruction resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decision {
    Candidate(i64),
    Tiles(Vec<i64>),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Candidate(v) => write!(f, "{}", v),
            Decision::Tiles(vs) => write!(f, "{:?}", vs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub kind: InstKind,
    #[serde(default)]
    pub inputs: Vec<Arg>,
    #[serde(default)]
    pub attrs: Vec<Attr>,
    #[serde(default)]
    pub outputs: Vec<AnyRV>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = descriptor(self.kind);
        if !self.outputs.is_empty() {
            let outs: Vec<String> = self.outputs.iter().map(|rv| display_rv(*rv)).collect();
            write!(f, "{} = ", outs.join(", "))?;
        }
        let mut args: Vec<String> = self
            .inputs
            .iter()
            .map(|a| match a {
                Arg::Rv(rv) => display_rv(*rv),
                Arg::Int(v) => v.to_string(),
                Arg::None => "None".to_string(),
            })
            .collect();
        for (i, attr) in self.attrs.iter().enumerate() {
            match desc.attrs.get(i) {
                Some(name) => args.push(format!("{}={}", name, attr)),
                None => args.push(attr.to_string()),
            }
        }
        if let Some(d) = &self.decision {
            args.push(format!("decision={}", d));
        }
        write!(f, "{}({})", desc.name, args.join(", "))
    }
}

// ── Trace ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    records: Vec<TraceRecord>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TraceRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A copy with record `index`'s decision replaced. With
    /// `remove_postproc`, records from the first `enter_postproc` marker on
    /// are dropped.
    pub fn with_decision(
        &self,
        index: usize,
        decision: Decision,
        remove_postproc: bool,
    ) -> ScheduleResult<Trace> {
        let Some(record) = self.records.get(index) else {
            return Err(malformed(format!(
                "record {} does not exist (trace has {})",
                index,
                self.records.len()
            )));
        };
        if !descriptor(record.kind).has_decision {
            return Err(malformed(format!(
                "record {} ({}) takes no decision",
                index,
                descriptor(record.kind).name
            )));
        }
        let mut out = self.clone();
        out.records[index].decision = Some(decision);
        if remove_postproc {
            if let Some(cut) = out
                .records
                .iter()
                .position(|r| r.kind == InstKind::EnterPostproc)
            {
                out.records.truncate(cut);
            }
        }
        Ok(out)
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string_pretty(self) {
            Ok(s) => s,
            Err(e) => panic!("internal error: trace serialization failed: {}", e),
        }
    }

    pub fn from_json(text: &str) -> ScheduleResult<Trace> {
        serde_json::from_str(text).map_err(|e| malformed(format!("invalid trace JSON: {}", e)))
    }

    /// Replay onto a fresh schedule over `program`.
    pub fn replay(&self, program: &Program, config: ScheduleConfig) -> ScheduleResult<Schedule> {
        let mut sch = Schedule::new(program, config);
        self.apply_to(&mut sch)?;
        Ok(sch)
    }

    /// Re-execute every record against `sch`, using recorded decisions.
    pub fn apply_to(&self, sch: &mut Schedule) -> ScheduleResult<()> {
        info!("replaying {} trace records", self.records.len());
        let mut rvs = RvMap::default();
        for (i, record) in self.records.iter().enumerate() {
            validate(record).map_err(|e| e.with_hint(format!("in trace record {}", i)))?;
            debug!("replay [{}] {}", i, record);
            let outputs = replay_one(sch, record, &rvs)?;
            if outputs.len() != record.outputs.len() {
                return Err(malformed(format!(
                    "record {} ({}) produced {} outputs on replay, recorded {}",
                    i,
                    descriptor(record.kind).name,
                    outputs.len(),
                    record.outputs.len()
                )));
            }
            for (old, new) in record.outputs.iter().zip(outputs) {
                rvs.0.insert(*old, new);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}

fn malformed(message: impl Into<String>) -> ScheduleError {
    ScheduleError::new(codes::S0901, "replay", message)
}

// ── Validation ──────────────────────────────────────────────────────────────

fn arg_fits(kind: RvKind, arg: &Arg) -> bool {
    match (kind, arg) {
        (RvKind::Loop, Arg::Rv(AnyRV::Loop(_))) => true,
        (RvKind::Block, Arg::Rv(AnyRV::Block(_))) => true,
        (RvKind::Expr, Arg::Rv(AnyRV::Expr(_))) => true,
        (RvKind::Stmt, Arg::Rv(AnyRV::Loop(_) | AnyRV::Block(_))) => true,
        (RvKind::Factor, Arg::Rv(AnyRV::Expr(_)) | Arg::Int(_) | Arg::None) => true,
        _ => false,
    }
}

/// Check a record's shape against its instruction descriptor.
fn validate(record: &TraceRecord) -> ScheduleResult<()> {
    let desc = descriptor(record.kind);
    if !desc.accepts_inputs(record.inputs.len()) {
        return Err(malformed(format!(
            "{} takes {} inputs, record has {}",
            desc.name,
            desc.inputs.len(),
            record.inputs.len()
        )));
    }
    for (i, arg) in record.inputs.iter().enumerate() {
        let fits = desc.input_kind(i).is_some_and(|k| arg_fits(k, arg));
        if !fits {
            return Err(malformed(format!(
                "{} input {} has the wrong kind",
                desc.name, i
            )));
        }
    }
    if record.attrs.len() != desc.attrs.len() {
        return Err(malformed(format!(
            "{} takes {} attributes, record has {}",
            desc.name,
            desc.attrs.len(),
            record.attrs.len()
        )));
    }
    if record.decision.is_some() && !desc.has_decision {
        return Err(malformed(format!("{} takes no decision", desc.name)));
    }
    if !desc.accepts_outputs(record.outputs.len()) {
        return Err(malformed(format!(
            "{} produces {} outputs, record has {}",
            desc.name,
            desc.outputs.len(),
            record.outputs.len()
        )));
    }
    for (i, out) in record.outputs.iter().enumerate() {
        let expected = if desc.variadic_outputs {
            desc.outputs.first().copied()
        } else {
            desc.outputs.get(i).copied()
        };
        let fits = expected.is_some_and(|k| arg_fits(k, &Arg::Rv(*out)));
        if !fits {
            return Err(malformed(format!(
                "{} output {} has the wrong kind",
                desc.name, i
            )));
        }
    }
    Ok(())
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Recorded handle -> handle in the schedule being replayed onto.
#[derive(Default)]
struct RvMap(HashMap<AnyRV, AnyRV>);

impl RvMap {
    fn get(&self, rv: AnyRV) -> ScheduleResult<AnyRV> {
        self.0.get(&rv).copied().ok_or_else(|| {
            malformed(format!(
                "{} is used before any record produces it",
                display_rv(rv)
            ))
        })
    }

    fn input(&self, record: &TraceRecord, i: usize) -> ScheduleResult<AnyRV> {
        match record.inputs.get(i) {
            Some(Arg::Rv(rv)) => self.get(*rv),
            _ => Err(malformed(format!("input {} is not a handle", i))),
        }
    }

    fn loop_at(&self, record: &TraceRecord, i: usize) -> ScheduleResult<LoopRV> {
        match self.input(record, i)? {
            AnyRV::Loop(l) => Ok(l),
            _ => Err(malformed(format!("input {} is not a loop", i))),
        }
    }

    fn block_at(&self, record: &TraceRecord, i: usize) -> ScheduleResult<BlockRV> {
        match self.input(record, i)? {
            AnyRV::Block(b) => Ok(b),
            _ => Err(malformed(format!("input {} is not a block", i))),
        }
    }

    fn loops_from(&self, record: &TraceRecord, start: usize) -> ScheduleResult<Vec<LoopRV>> {
        (start..record.inputs.len())
            .map(|i| self.loop_at(record, i))
            .collect()
    }

    fn factor_at(&self, record: &TraceRecord, i: usize) -> ScheduleResult<Factor> {
        match record.inputs.get(i) {
            Some(Arg::Rv(rv)) => match self.get(*rv)? {
                AnyRV::Expr(e) => Ok(Factor::Rv(e)),
                _ => Err(malformed(format!("factor {} is not an expression", i))),
            },
            Some(Arg::Int(v)) => Ok(Factor::Int(*v)),
            Some(Arg::None) => Ok(Factor::Infer),
            None => Err(malformed(format!("factor {} is missing", i))),
        }
    }
}

fn attr_int(record: &TraceRecord, i: usize) -> ScheduleResult<i64> {
    match record.attrs.get(i) {
        Some(Attr::Int(v)) => Ok(*v),
        _ => Err(malformed(format!("attribute {} is not an integer", i))),
    }
}

fn attr_index(record: &TraceRecord, i: usize) -> ScheduleResult<usize> {
    let v = attr_int(record, i)?;
    usize::try_from(v).map_err(|_| malformed(format!("attribute {} is negative", i)))
}

fn attr_str(record: &TraceRecord, i: usize) -> ScheduleResult<&str> {
    match record.attrs.get(i) {
        Some(Attr::Str(s)) => Ok(s),
        _ => Err(malformed(format!("attribute {} is not a string", i))),
    }
}

fn attr_bool(record: &TraceRecord, i: usize) -> ScheduleResult<bool> {
    match record.attrs.get(i) {
        Some(Attr::Bool(b)) => Ok(*b),
        _ => Err(malformed(format!("attribute {} is not a boolean", i))),
    }
}

fn attr_ints(record: &TraceRecord, i: usize) -> ScheduleResult<Vec<i64>> {
    match record.attrs.get(i) {
        Some(Attr::Ints(vs)) => Ok(vs.clone()),
        _ => Err(malformed(format!("attribute {} is not an integer list", i))),
    }
}

fn attr_floats(record: &TraceRecord, i: usize) -> ScheduleResult<Vec<f64>> {
    match record.attrs.get(i) {
        Some(Attr::Floats(vs)) => Ok(vs.clone()),
        // Whole-number lists deserialize as integers.
        Some(Attr::Ints(vs)) => Ok(vs.iter().map(|v| *v as f64).collect()),
        _ => Err(malformed(format!("attribute {} is not a number list", i))),
    }
}

fn loops_out(v: Vec<LoopRV>) -> Vec<AnyRV> {
    v.into_iter().map(AnyRV::from).collect()
}

fn blocks_out(v: Vec<BlockRV>) -> Vec<AnyRV> {
    v.into_iter().map(AnyRV::from).collect()
}

fn exprs_out(v: Vec<ExprRV>) -> Vec<AnyRV> {
    v.into_iter().map(AnyRV::from).collect()
}

fn replay_one(sch: &mut Schedule, r: &TraceRecord, rvs: &RvMap) -> ScheduleResult<Vec<AnyRV>> {
    Ok(match r.kind {
        InstKind::GetBlock => vec![sch.get_block(attr_str(r, 0)?)?.into()],
        InstKind::GetLoops => loops_out(sch.get_loops(rvs.block_at(r, 0)?)?),
        InstKind::GetChildBlocks => blocks_out(sch.get_child_blocks(rvs.input(r, 0)?)?),
        InstKind::GetProducers => blocks_out(sch.get_producers(rvs.block_at(r, 0)?)?),
        InstKind::GetConsumers => blocks_out(sch.get_consumers(rvs.block_at(r, 0)?)?),
        InstKind::Split => {
            let factors = (1..r.inputs.len())
                .map(|i| rvs.factor_at(r, i))
                .collect::<ScheduleResult<Vec<_>>>()?;
            loops_out(sch.split(rvs.loop_at(r, 0)?, &factors)?)
        }
        InstKind::Fuse => vec![sch.fuse(&rvs.loops_from(r, 0)?)?.into()],
        InstKind::Reorder => {
            sch.reorder(&rvs.loops_from(r, 0)?)?;
            Vec::new()
        }
        InstKind::Parallel => {
            sch.parallel(rvs.loop_at(r, 0)?)?;
            Vec::new()
        }
        InstKind::Vectorize => {
            sch.vectorize(rvs.loop_at(r, 0)?)?;
            Vec::new()
        }
        InstKind::Bind => {
            sch.bind(rvs.loop_at(r, 0)?, attr_str(r, 0)?)?;
            Vec::new()
        }
        InstKind::Unroll => {
            sch.unroll(rvs.loop_at(r, 0)?)?;
            Vec::new()
        }
        InstKind::CacheRead => {
            let b = sch.cache_read(rvs.block_at(r, 0)?, attr_index(r, 0)?, attr_str(r, 1)?)?;
            vec![b.into()]
        }
        InstKind::CacheWrite => {
            let b = sch.cache_write(rvs.block_at(r, 0)?, attr_index(r, 0)?, attr_str(r, 1)?)?;
            vec![b.into()]
        }
        InstKind::ComputeAt => {
            sch.compute_at(rvs.block_at(r, 0)?, rvs.loop_at(r, 1)?, attr_bool(r, 0)?)?;
            Vec::new()
        }
        InstKind::ReverseComputeAt => {
            sch.reverse_compute_at(rvs.block_at(r, 0)?, rvs.loop_at(r, 1)?, attr_bool(r, 0)?)?;
            Vec::new()
        }
        InstKind::ComputeInline => {
            sch.compute_inline(rvs.block_at(r, 0)?)?;
            Vec::new()
        }
        InstKind::ReverseComputeInline => {
            sch.reverse_compute_inline(rvs.block_at(r, 0)?)?;
            Vec::new()
        }
        InstKind::DecomposeReduction => {
            vec![sch
                .decompose_reduction(rvs.block_at(r, 0)?, rvs.loop_at(r, 1)?)?
                .into()]
        }
        InstKind::RFactor => vec![sch.rfactor(rvs.loop_at(r, 0)?, attr_int(r, 0)?)?.into()],
        InstKind::StorageAlign => {
            sch.storage_align(
                rvs.block_at(r, 0)?,
                attr_index(r, 0)?,
                attr_int(r, 1)?,
                attr_int(r, 2)?,
                attr_int(r, 3)?,
            )?;
            Vec::new()
        }
        InstKind::SetScope => {
            sch.set_scope(rvs.block_at(r, 0)?, attr_index(r, 0)?, attr_str(r, 1)?)?;
            Vec::new()
        }
        InstKind::SampleCategorical => {
            let decision = match &r.decision {
                Some(Decision::Candidate(v)) => Some(*v),
                None => None,
                Some(Decision::Tiles(_)) => {
                    return Err(malformed("sample_categorical decision must be one candidate"))
                }
            };
            let candidates = attr_ints(r, 0)?;
            let probs = attr_floats(r, 1)?;
            vec![sch.sample_categorical(&candidates, &probs, decision)?.into()]
        }
        InstKind::SamplePerfectTile => {
            let decision = match &r.decision {
                Some(Decision::Tiles(vs)) => Some(vs.as_slice()),
                None => None,
                Some(Decision::Candidate(_)) => {
                    return Err(malformed("sample_perfect_tile decision must be a factor list"))
                }
            };
            exprs_out(sch.sample_perfect_tile(
                rvs.loop_at(r, 0)?,
                attr_index(r, 0)?,
                attr_int(r, 1)?,
                decision,
            )?)
        }
        InstKind::EnterPostproc => {
            sch.enter_postproc();
            Vec::new()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            seed: Some(3),
            ..ScheduleConfig::default()
        }
    }

    #[test]
    fn display_uses_attribute_names() {
        let mut sch = Schedule::new(&workload::matmul(16, 16, 16), config());
        let c = sch.get_block("C").unwrap();
        let loops = sch.get_loops(c).unwrap();
        sch.split(loops[0], &[Factor::Infer, Factor::Int(4)]).unwrap();
        let text = sch.trace().to_string();
        assert_eq!(
            text,
            "b0 = get_block(name=\"C\")\n\
             l1, l2, l3 = get_loops(b0)\n\
             l4, l5 = split(l1, None, 4)\n"
        );
    }

    #[test]
    fn json_round_trip_preserves_records() {
        let mut sch = Schedule::new(&workload::matmul(16, 16, 16), config());
        let c = sch.get_block("C").unwrap();
        let loops = sch.get_loops(c).unwrap();
        let tiles = sch.sample_perfect_tile(loops[0], 2, 8, None).unwrap();
        let factors: Vec<Factor> = tiles.iter().map(|t| Factor::Rv(*t)).collect();
        sch.split(loops[0], &factors).unwrap();
        sch.sample_categorical(&[1, 2, 4], &[0.25, 0.25, 0.5], None).unwrap();
        let json = sch.trace().to_json();
        assert_eq!(&Trace::from_json(&json).unwrap(), sch.trace());
    }

    #[test]
    fn malformed_records_rejected() {
        let bad_arity = r#"{"records":[{"kind":"get_block","attrs":[]}]}"#;
        let trace = Trace::from_json(bad_arity).unwrap();
        let mut sch = Schedule::new(&workload::scale_1d(8), config());
        assert_eq!(trace.apply_to(&mut sch).unwrap_err().code, codes::S0901);

        let unbound = r#"{"records":[{"kind":"get_loops","inputs":[{"rv":{"Block":7}}],
            "outputs":[{"Loop":8}]}]}"#;
        let trace = Trace::from_json(unbound).unwrap();
        let mut sch = Schedule::new(&workload::scale_1d(8), config());
        assert_eq!(trace.apply_to(&mut sch).unwrap_err().code, codes::S0901);

        assert_eq!(Trace::from_json("not json").unwrap_err().code, codes::S0901);
    }

    #[test]
    fn with_decision_rewrites_and_cuts_postproc() {
        let mut sch = Schedule::new(&workload::scale_1d(8), config());
        sch.sample_categorical(&[1, 2], &[0.5, 0.5], None).unwrap();
        sch.enter_postproc();
        sch.get_block("B").unwrap();
        let trace = sch.trace().clone();
        let edited = trace.with_decision(0, Decision::Candidate(2), true).unwrap();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited.records()[0].decision, Some(Decision::Candidate(2)));
        assert!(trace.with_decision(1, Decision::Candidate(2), false).is_err());
        assert!(trace.with_decision(9, Decision::Candidate(2), false).is_err());
    }
}
