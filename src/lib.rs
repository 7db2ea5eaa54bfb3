//! Windowguard - Distributed Fixed-Window Rate Limiting
//!
//! This crate implements a fixed-window rate limiter whose counter lives in an
//! external strongly-consistent key-value store. Every process that builds a
//! limiter with the same base key against the same store enforces one shared
//! limit, with no in-process locking.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
