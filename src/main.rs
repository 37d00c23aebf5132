//! Kernel ELF binary entry point.
//!
//! The actual boot handoff lives in `talus_kernel_lib::boot::entry` via
//! `bootloader_api::entry_point!`; this binary exists only to produce
//! the kernel image the bootloader links, pulling the library crate in
//! so its `#[no_mangle] _start` symbol survives to the final ELF.

#![no_std]
#![no_main]

extern crate talus_kernel_lib as _;
