//! # Kernel Filter Module
//!
//! Classic BPF programs that select one DroneBridge channel in the kernel.
//!
//! This module handles:
//! - Building the per-(comm id, direction, port) filter program
//! - Structural validation with the same rules the kernel applies
//! - Simulating a program against captured frames for testing and diagnostics

pub mod program;
pub mod vm;

pub use program::{build_filter, FilterInstruction, FilterProgram, LinkFilter, MAX_CAPTURE_LEN};
pub use vm::Verdict;
