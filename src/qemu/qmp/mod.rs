//! QMP (QEMU Machine Protocol) control channel.
//!
//! QMP is a JSON-based control interface built into QEMU. The harness uses
//! it for one thing: `screendump`, to capture the emulated framebuffer when
//! the guest asks for a screenshot.
//!
//! # Wire format
//!
//! One JSON object per line in each direction. QEMU greets with
//! `{"QMP": {...}}`, the client answers `{"execute": "qmp_capabilities"}`
//! and gets `{"return": {}}`. After that every command gets exactly one
//! reply, possibly preceded by `{"event": ...}` notifications.

mod client;
mod pipe;

pub use client::{empty_success, ClientState, QmpClient};
pub use pipe::{ControlChannel, ControlStreams};
