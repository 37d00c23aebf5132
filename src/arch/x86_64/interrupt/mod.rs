//! Interrupt-controller bring-up. Only the legacy 8259 path is
//! implemented; see `pic` module docs.

pub mod pic;
