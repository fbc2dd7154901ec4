//! # Control Panel Protocol
//!
//! Challenge/response authentication followed by a named-command exchange,
//! built entirely on the bundle channel's [`ChannelState`] hook contract.
//!
//! [`ChannelState`]: crate::transport::channel::ChannelState

pub mod auth;
pub mod control;

pub use auth::{ChallengeCipher, CipherDirectory, SecretCipher};
pub use control::{ControlPanel, ControlPanelProtocol, COMMANDS_LIST, COMMANDS_SEND};
