//! # DB Link Library
//!
//! Kernel-filtered receive sockets for DroneBridge raw 802.11 links.
//!
//! A DroneBridge link carries several independent channels (control,
//! telemetry, communication, ...) over one radio in monitor mode. Each
//! receiving module opens its own raw socket with a classic BPF program that
//! selects only its (communication id, direction, port) triple, so unrelated
//! WiFi traffic is dropped inside the kernel before any copy to user space.

pub mod config;
pub mod error;
pub mod filter;
pub mod link;
pub mod protocol;
