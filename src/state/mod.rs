// src/state/mod.rs

pub mod groups;
pub mod window;
pub mod zones;
