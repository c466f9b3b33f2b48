//! Getting builds unstuck: the recovery planner for phases that fail their
//! checks, and the restart sweep for builds whose task died with the process.

pub mod orphan;
pub mod planner;
