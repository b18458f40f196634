//! The aggregation pipeline evaluator: stages consume a sequence of documents and produce
//! another. Terminal sinks (`$out`, `$merge`) are split off by the parser and applied by the
//! `aggregate` handler under the same store lock as the pipeline run.

pub(crate) mod expr;
mod projection;
mod stage;


pub(crate) use self::{
    projection::apply_projection,
    stage::{parse_pipeline, run_pipeline, TerminalStage},
};
