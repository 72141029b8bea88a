//! Xpriso message protocol
//!
//! The messages proxies exchange: conveyed objects, requests, lock transfers,
//! ordered change events and the cease-communications flag.

pub mod codec;
pub mod logger;
pub mod message;

pub use codec::{decode, encode};
pub use message::{ConveyedObject, XprisoMessage};
