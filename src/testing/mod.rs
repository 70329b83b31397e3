//! Test doubles for exercising a session without a broker

pub mod mocks;

pub use mocks::*;
