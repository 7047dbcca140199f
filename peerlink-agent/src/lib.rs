//! # peerlink-agent
//!
//! Command-line peer built on `peerlink-core`: pairs with another device
//! by PIN, shares a local directory over a permanent stream session, and
//! browses or downloads from a paired peer over TCP.

pub mod config;
pub mod service;
