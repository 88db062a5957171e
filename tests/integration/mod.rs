//! Integration test suite for keystone.
//!
//! These tests drive the coordinator end to end against the in-memory
//! marketplace and scripted decisions. No network or terminal access.
//!
//! # Test Categories
//!
//! - `execution_e2e`: Full runs, dry runs, validation halts
//! - `partial_failure`: Failure isolation and dependency timing
//! - `approvals`: Approval points, per-task approvals, budget gates
//! - `interactive`: Task selection and modify-mode plan edits
//! - `cancellation`: Cancellation and timeouts
//! - `persistence`: Project store, resume, dry-run record equality


mod partial_failure;
mod approvals;
mod interactive;
mod cancellation;
