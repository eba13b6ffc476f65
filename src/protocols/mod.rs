//! Protocol adapters.
//!
//! Each submodule provides one implementation of the adapter contract in
//! [`crate::core::traits`]. Modbus TCP is the reference implementation;
//! further protocols plug in behind the same contract.

pub mod modbus;
