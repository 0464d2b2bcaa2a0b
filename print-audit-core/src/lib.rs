#![doc = "print-audit-core: the synchronisation and reconstruction engine behind print-audit."]

//! This crate holds the pipeline that turns a remote folder of encrypted
//! print-stream fragments into one viewable artifact per job:
//!
//! 1. [`stability`]: wait until the remote folder stops changing.
//! 2. [`fetch`]: transfer and decrypt only what is new, recording progress in
//!    [`progress`] so restarts never redo finished work.
//! 3. [`grouping`]: recover job structure from file names.
//! 4. [`merge`]: concatenate each job's parts into a timestamped artifact.
//! 5. [`convert`]: hand artifacts to external renderers.
//!
//! [`synchronise`] orchestrates the stages. All I/O with the outside world
//! goes through the traits in [`contract`], so the whole pipeline runs
//! against mocks in tests.
//!
//! # Usage
//! The `print-audit` binary is the main consumer; integration tests enable the
//! `test-export-mocks` feature to reach the generated mocks.

pub mod config;
pub mod contract;
pub mod convert;
pub mod decrypt;
pub mod fetch;
pub mod grouping;
pub mod merge;
pub mod progress;
pub mod report;
pub mod stability;
pub mod synchronise;
pub mod transport;
