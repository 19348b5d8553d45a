//! # kh-receiver: depth stream receiver
//!
//! Pings a kh-sender, reassembles and decodes the stream it answers
//! with, and reports the frames on the console. Decoded frames are
//! available on a watch channel for a real renderer to consume.

pub mod config;
pub mod service;
pub mod viewer;
