//! Real-time signaling relay for browser peers.
//!
//! Peers connect over WebSocket, join named rooms, and exchange
//! offer/answer/ICE candidate blobs addressed by connection id.

pub mod config;
pub mod signaling;
