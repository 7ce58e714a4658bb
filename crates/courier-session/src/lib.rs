//! # courier-session
//!
//! Login state machines for avatars: the QR flow with its regeneration
//! cycle, and the two-step phone flow.

pub mod authenticator;

pub use authenticator::{AuthFlowStatus, PhoneCompletion, QrTiming, SessionAuthenticator};
