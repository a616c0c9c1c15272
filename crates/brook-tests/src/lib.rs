//! Scenario tests for the Brook ledger.
//!
//! Each test opens one or more full nodes on temp directories, feeds them
//! blocks through the ingestion pipeline and checks branch bookkeeping,
//! output state and checkpoint recovery from the outside.

pub mod helpers;
