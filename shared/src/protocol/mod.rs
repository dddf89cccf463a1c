//! Framing for records shipped from the host drainer to an analyzer

pub mod wire;
