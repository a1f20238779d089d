//! procmux wire protocol
//!
//! JSON message types exchanged between the event hub and its WebSocket
//! subscribers.
//!
//! This crate contains:
//! - `Message`, the envelope every frame is encoded as
//! - `Payload`, one variant per `MessageType` with its typed `data`
//! - `ProcessStatus` and `StatusPayload` for process lifecycle frames
//! - channel-name helpers shared by the hub and its publishers

pub mod channels;
pub mod message;

pub use message::{DecodeError, Message, MessageType, Payload, ProcessStatus, StatusPayload};
