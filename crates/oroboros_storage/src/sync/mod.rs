//! # Concurrency & Safety
//!
//! Structural changes need `&mut EntityStore`, so the compiler already rules
//! out overlapping mutation. This module covers what the borrow checker
//! cannot see:
//!
//! - **Jobs** sharing `&EntityStore` register access per component type;
//!   structural changes wait for it to drain ([`AccessTracker`])
//! - **Change versions** tell systems which chunks were written since they
//!   last ran ([`GlobalVersion`], [`did_change`])
//! - **Enabled bits** are toggled lock-free from many threads ([`EnabledMask`])

mod access;
mod enabled;
mod version;

pub use access::{AccessGuard, AccessMode, AccessTracker, SafetyHandle};
pub use enabled::{words_for, EnabledMask};
pub use version::{did_change, GlobalVersion};
