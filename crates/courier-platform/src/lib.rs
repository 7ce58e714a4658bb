//! # courier-platform
//!
//! Messaging platform bridges for Courier. Each bridge implements
//! [`courier_core::traits::PlatformHandler`] over the local session
//! daemon for its platform.

pub mod qr;
pub mod telegram;

pub use telegram::TelegramBridge;
