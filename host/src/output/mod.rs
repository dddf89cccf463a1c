//! Report output

pub mod json;
