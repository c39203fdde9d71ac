//! # tenon-core
//!
//! Shared kernel for the Tenon pipeline engine.
//!
//! This crate carries the types every other Tenon crate agrees on:
//!
//! - **Object metadata**: names, namespaces, annotations, owner references,
//!   and the optimistic-concurrency token used for status writes
//! - **Name rules**: DNS-label validation and deterministic child-name
//!   derivation for objects created on behalf of a run
//! - **Conditions**: the single `Succeeded` condition type published by
//!   every run, with monotone terminal-state semantics
//!
//! Nothing in this crate talks to the substrate; it is pure data and
//! invariant enforcement.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod condition;
pub mod error;
pub mod meta;
pub mod name;

pub use condition::{Condition, ConditionStatus, SucceededReason};
pub use error::{Error, Result};
pub use meta::{ObjectMeta, OwnerReference};
pub use name::{child_name, validate_dns_label};
