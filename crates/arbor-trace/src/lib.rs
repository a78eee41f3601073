//! Execution trace recording for arbor behavior trees.
//!
//! The scheduler reports every search, task transition and auxiliary-node change as a small
//! [`TraceEvent`]. Events can be kept in memory ([`TraceLog`]) for tests and replays, streamed to
//! a [`TraceSink`] for live tooling, or both. With neither attached, tracing costs one branch.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod trace;

pub use trace::{tags, NullTraceSink, TraceEvent, TraceLog, TraceSink, Tracer, VecTraceSink};
