#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod bus;
pub mod crc;
pub mod error;
pub mod frame;
pub mod link;
pub mod modbus;
pub mod stats;

#[cfg(test)]
pub(crate) mod testkit;
