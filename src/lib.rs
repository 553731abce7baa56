#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

//! # Getting started
//!
//! All functionality is reached through the [`Client`] type, which owns an
//! ISO-DEP [`Transport`] and (once authenticated) an EV2 secure-messaging
//! session. See the crate README for a usage example.
//!
//! The protocol implemented here is described in NXP's NT4H2421Gx data
//! sheet and application note AN12196 ("NTAG 424 DNA and NTAG 424 DNA
//! TagTamper features and hints").

pub mod apdu;
pub mod client;
pub mod command;
pub mod crypto;
pub mod error;
pub mod file;
pub mod key;
#[cfg(feature = "mocktag")]
pub mod mocktag;
mod session;
pub mod transport;

#[cfg(feature = "mocktag")]
pub use crate::mocktag::MockTag;
pub use crate::{
    client::Client,
    error::{Error, Result},
    file::{CommMode, FileId},
    key::{Key, KeySlot},
    transport::Transport,
};
