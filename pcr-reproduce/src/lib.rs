//! # PCR Reproduction
//!
//! Forensic tooling over the TPM command logs produced by `bootflow`: given
//! a recorded log and a known-good PCR0 digest, find the corrections that
//! explain the difference.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`bruteforce`] | bit-flip enumeration over a byte window, sequential or on rayon |
//! | [`reproduce`] | iterative-deepening search over disabled, reordered and corrected extends |
//! | [`eventlog`] | reconciliation against an external TPM event log |
//! | [`settings`] | TOML-loadable search bounds |

pub mod bruteforce;
pub mod eventlog;
pub mod reproduce;
pub mod settings;

pub use bruteforce::{apply_flips, binomial, BitFlipSolution, BruteForceError, BruteForceProblem, Combinations};
pub use eventlog::{reconcile, EventDisposition, EventLogSanitizer, HrotSanitizer, NoSanitizer, Reconciliation, ReplayIssue};
pub use reproduce::{reproduce_pcr0, ReproduceError, ReproducePcr0Result, WindowCorrection};
pub use settings::{CorrectionTarget, ReproduceSettings};
