#![doc = include_str!("../README.md")]

mod error;

pub mod coding;
pub mod dataunit;
pub mod framing;
pub mod spacepacket;
pub mod timecode;

pub use error::{Error, Result};
