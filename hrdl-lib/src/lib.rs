#![doc = include_str!("../README.md")]

mod error;

pub mod framing;
pub mod hrdl;
pub mod net;
pub mod pipeline;
pub mod relay;
pub mod ring;
pub mod store;
pub mod sum;

pub use error::{Error, Result};
