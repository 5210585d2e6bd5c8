//! Visually-duplicate image finder with reversible triage.
//!
//! A scan harvests image files, extracts a perceptual signature for each,
//! clusters near-duplicates by greedy pairwise reduction and persists the
//! clusters as JSON Lines. A triage session then moves selected files out
//! of the way, recording every move in a ledger so it can be undone.

pub mod config;
pub mod core;
pub mod services;
