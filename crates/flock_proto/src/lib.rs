#![doc = include_str!("../README.md")]

pub mod input_map;
pub mod msg;
pub mod node;
pub mod peer;
pub mod seq;
pub mod session;
pub mod timer;
pub mod view;
