#![no_std]

pub mod error;
