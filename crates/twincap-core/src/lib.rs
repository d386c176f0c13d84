#![doc = include_str!("../README.md")]

pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod replay;
pub mod time_base;
