//! VGA text-mode console.
//!
//! Grounded on the teacher's `vga` module shape (color byte, a locked
//! writer implementing `core::fmt::Write`) trimmed of its multi-console
//! and scrollback machinery and the `volatile` crate dependency, which
//! is not in the teacher's (or the pack's) `Cargo.toml`: writes go
//! through `core::ptr::write_volatile` directly.

use core::fmt::{self, Write};
use spin::Mutex;

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;
const VGA_ADDRESS: usize = 0xb8000;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightRed = 12,
    Yellow = 14,
    White = 15,
}

#[derive(Clone, Copy)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(fg: Color, bg: Color) -> ColorCode {
        ColorCode((bg as u8) << 4 | (fg as u8))
    }
}

struct Writer {
    col: usize,
    color: ColorCode,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.col;
                self.put(row, col, byte, self.color);
                self.col += 1;
            }
        }
    }

    fn put(&self, row: usize, col: usize, byte: u8, color: ColorCode) {
        let offset = (row * BUFFER_WIDTH + col) * 2;
        unsafe {
            let ptr = (VGA_ADDRESS + offset) as *mut u8;
            core::ptr::write_volatile(ptr, byte);
            core::ptr::write_volatile(ptr.add(1), color.0);
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let offset = ((row - 1) * BUFFER_WIDTH + col) * 2;
                let src = (VGA_ADDRESS + (row * BUFFER_WIDTH + col) * 2) as *const u8;
                let dst = (VGA_ADDRESS + offset) as *mut u8;
                unsafe {
                    let b = core::ptr::read_volatile(src);
                    let c = core::ptr::read_volatile(src.add(1));
                    core::ptr::write_volatile(dst, b);
                    core::ptr::write_volatile(dst.add(1), c);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.col = 0;
    }

    fn clear_row(&self, row: usize) {
        for col in 0..BUFFER_WIDTH {
            self.put(row, col, b' ', self.color);
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
        Ok(())
    }
}

static WRITER: Mutex<Writer> = Mutex::new(Writer { col: 0, color: ColorCode::new(Color::LightGray, Color::Black) });

pub fn print(s: &str) {
    let mut w = WRITER.lock();
    let _ = w.write_str(s);
}

pub fn print_fmt(args: fmt::Arguments) {
    let mut w = WRITER.lock();
    let _ = w.write_fmt(args);
}

/// Bypasses the lock entirely; used from panic/double-fault paths where
/// the writer may already be held.
pub fn print_critical(s: &str) {
    let mut w = Writer { col: 0, color: ColorCode::new(Color::LightRed, Color::Black) };
    let _ = w.write_str(s);
}

pub fn clear() {
    let mut w = WRITER.lock();
    for row in 0..BUFFER_HEIGHT {
        w.clear_row(row);
    }
    w.col = 0;
}
