#![deny(unused_must_use)]

pub mod buffer;
pub mod geometry;
pub mod io;
pub mod preprocess;
pub mod store;
mod trace_utils;

pub use nalgebra;
