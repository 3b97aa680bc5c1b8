// src/lib.rs
pub mod analysis;
pub mod observer;
pub mod params;
pub mod runner;
pub mod table;
pub mod types;
