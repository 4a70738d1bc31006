//! Helper Capabilities Core Library
//!
//! This library lets a virtualization host manager discover which optional
//! features an installed build of the disk-image helper supports before it
//! constructs command lines that use that helper as a disk backend:
//! - Closed, ordered capability flag enumeration with a stable name table
//! - Immutable-after-probe capability bit sets shared via `Arc`
//! - A prober that turns helper self-description output into typed flags
//! - Per-process memoization keyed by helper path and binary mtime
//!
//! Probing is blocking; schedule it off latency-sensitive paths.

pub mod cache;
pub mod flags;
pub mod probe;
pub mod set;

pub use cache::CapsCache;
pub use flags::{CapFlag, Listing, UnknownFlagName};
pub use probe::{Invoke, InvokeFailure, ProbeError, Prober, RunnerInvoker};
pub use set::{CapSet, HelperCaps};
