//! # kh-sender: depth camera streaming sender
//!
//! Waits for a receiver to ping its UDP port, then captures, encodes
//! and streams depth + color frames until the session fails or the
//! process is stopped. After each session it asks for a port again.
//!
//! The binary ships with a synthetic camera so the whole pipeline runs
//! without hardware; real devices plug in through
//! [`kh_core::stream::DepthCamera`].

pub mod config;
pub mod service;
