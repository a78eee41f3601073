//! Navigation call contract for behavior trees.
//!
//! Path following is an external service: a [`PathFollowing`] implementation accepts move
//! requests and later reports completion through a [`MOVE_FINISHED`] message. [`MoveTo`] drives
//! it from a tree, and [`StraightLineMover`] is a minimal follower for tests and prototypes.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod following;
pub mod mover;
pub mod tasks;
pub mod world;

pub use following::{
    move_finished, MoveRequest, MoveRequestId, MoveRequestResult, PathFollowing, MOVE_FINISHED,
};
pub use mover::StraightLineMover;
pub use tasks::MoveTo;
pub use world::NavWorldMut;
