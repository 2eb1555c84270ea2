// ABOUTME: Library root for hostwire - trust material, SSH execution and fan-out helpers.
// ABOUTME: The thin CLI is in main.rs.

pub mod concurrent;
pub mod config;
pub mod error;
pub mod ssh;
pub mod trust;
