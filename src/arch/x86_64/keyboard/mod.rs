//! PS/2 keyboard (i8042): scancode-set-1 decode into a cooked ASCII
//! ring buffer, polled by the `read` syscall on fd 0.
//!
//! Grounded on the teacher's `keyboard` module shape (ring buffer fed
//! from an IRQ handler, blocking/non-blocking reader API) trimmed of
//! its KeyEvent/modifier/function-key model: SPEC_FULL.md's console
//! only needs raw bytes for `read(STDIN_FILENO, ...)`.

use crate::arch::x86_64::port::inb;
use spin::Mutex;

const PS2_DATA: u16 = 0x60;
const RING_CAP: usize = 256;

struct Ring {
    buf: [u8; RING_CAP],
    head: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Ring {
        Ring { buf: [0; RING_CAP], head: 0, len: 0 }
    }

    fn push(&mut self, b: u8) {
        if self.len == RING_CAP {
            return; // drop on overflow
        }
        let tail = (self.head + self.len) % RING_CAP;
        self.buf[tail] = b;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % RING_CAP;
        self.len -= 1;
        Some(b)
    }
}

static RING: Mutex<Ring> = Mutex::new(Ring::new());
static SHIFT: Mutex<bool> = Mutex::new(false);

/// US QWERTY scancode-set-1 make-codes, unshifted.
const LOWER: [u8; 0x3a] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0,
    b'a', b's', b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\',
    b'z', b'x', b'c', b'v', b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

const UPPER: [u8; 0x3a] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0,
    b'A', b'S', b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|',
    b'Z', b'X', b'C', b'V', b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ',
];

const LSHIFT_MAKE: u8 = 0x2a;
const RSHIFT_MAKE: u8 = 0x36;
const BREAK_BIT: u8 = 0x80;

pub fn init() {
    crate::log::logger::log_info("keyboard", format_args!("PS/2 scancode-set-1 decoder ready"));
}

/// Called from the keyboard IRQ handler (vector `pic::KEYBOARD_VECTOR`).
pub fn kbd_irq() {
    let code = unsafe { inb(PS2_DATA) };
    let released = code & BREAK_BIT != 0;
    let make = code & !BREAK_BIT;

    if make == LSHIFT_MAKE || make == RSHIFT_MAKE {
        *SHIFT.lock() = !released;
        return;
    }
    if released {
        return;
    }

    let idx = make as usize;
    if idx >= LOWER.len() {
        return;
    }
    let shifted = *SHIFT.lock();
    let table = if shifted { &UPPER } else { &LOWER };
    let ch = table[idx];
    if ch != 0 {
        RING.lock().push(ch);
    }
}

/// Non-blocking read of one cooked byte.
pub fn poll_byte() -> Option<u8> {
    RING.lock().pop()
}
