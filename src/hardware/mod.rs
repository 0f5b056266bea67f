//! Device capabilities and their in-process implementations.

pub mod capabilities;
pub mod mock;
pub mod peripheral;
