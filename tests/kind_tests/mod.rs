//! Integration tests against a live cluster
//!
//! Tests tell the story of the reconciler meeting a real API server:
//!
//! - `authorization`: create-if-absent semantics, pre-existing objects left
//!   untouched, and done-marker short-circuiting

mod authorization;
mod helpers;
