//! Inbound bounce processing — mailbox scanning and correlation back to
//! campaigns.

pub mod correlator;
pub mod imap;
pub mod scanner;

pub use correlator::{BounceCorrelator, BounceOutcome};
pub use scanner::{BounceScanner, ScanSummary};
