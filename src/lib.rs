//! Library to replicate [ZFS] auto-snapshots to a secondary target.
//!
//! Every dataset is replicated as an incremental chain of snapshots that
//! survives crashes and restarts. The coordination logic lives in
//! [`replication`] and is written against the collaborator traits of
//! [`catalog`], [`transfer`] and [`service`].
//!
//! [ZFS]: https://openzfs.org/

#![forbid(unsafe_code)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod replication;
pub mod service;
pub mod transfer;
