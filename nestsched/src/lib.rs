// nestsched — loop-nest scheduling engine
//
// Library root. Leaves first: IR and arithmetic, the structural index and
// scope analysis, the schedule state, the primitive library, then handles,
// sampling, trace and the façade.

pub mod arith;
pub mod diag;
pub mod id;
pub mod ir;
pub mod printer;
pub mod sref;

pub mod scope;
pub mod state;

pub mod annotate;
pub mod cache_stage;
pub mod compute_location;
pub mod for_kind;
pub mod inline;
pub mod lookup;
pub mod loop_transform;
pub mod reduction;

pub mod instruction;
pub mod rv;
pub mod sampler;
pub mod schedule;
pub mod trace;

pub mod eval;
pub mod workload;

pub use diag::{ErrorRenderLevel, ScheduleError, ScheduleResult};
pub use id::{AnyRV, BlockRV, ExprRV, LoopRV, SRefId};
pub use schedule::{Factor, Schedule, ScheduleConfig};
pub use state::DebugMask;
pub use trace::Trace;
