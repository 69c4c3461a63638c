//! # hopscan-cli
//!
//! Shared plumbing for the two front-ends: option parsing and conflict
//! checks, probe-skeleton building, and output rendering with optional
//! reverse DNS. The binaries differ only in which algorithm they default
//! to.

pub mod options;
pub mod render;
pub mod skeleton;
