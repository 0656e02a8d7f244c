// src/engine/mod.rs

pub mod fusion;
pub mod pipeline;
