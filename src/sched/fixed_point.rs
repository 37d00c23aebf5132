//! 17.14 signed fixed-point arithmetic for the MLFQ scheduler.
//!
//! Mirrors the reference scheduler's fixed-point helpers bit for bit:
//! numbers are stored as `i32` with the low 14 bits as fraction. Division
//! truncates toward zero; rounding is "add half the denominator before
//! the final shift."

pub const FP_SHIFT: i32 = 14;
pub const FP_ONE: i32 = 1 << FP_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(pub i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    pub fn from_int(n: i32) -> Fixed {
        Fixed(n * FP_ONE)
    }

    pub fn to_int_trunc(self) -> i32 {
        self.0 / FP_ONE
    }

    pub fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + FP_ONE / 2) / FP_ONE
        } else {
            (self.0 - FP_ONE / 2) / FP_ONE
        }
    }

    pub fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }

    pub fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }

    pub fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * FP_ONE)
    }

    pub fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * FP_ONE)
    }

    pub fn mul(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * rhs.0 as i64) / FP_ONE as i64) as i32)
    }

    pub fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    pub fn div(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * FP_ONE as i64) / rhs.0 as i64) as i32)
    }

    pub fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }
}

impl core::ops::Add for Fixed {
    type Output = Fixed;
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed::add(self, rhs)
    }
}

impl core::ops::Sub for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed::sub(self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_int() {
        let f = Fixed::from_int(59);
        assert_eq!(f.to_int_trunc(), 59);
    }

    #[test]
    fn rounding_matches_reference_halves() {
        // 5 / 2 in fixed point rounds to 3, not 2 (round-half-up for positives).
        let five = Fixed::from_int(5);
        let two = Fixed::from_int(2);
        assert_eq!(five.div(two).to_int_round(), 3);
    }

    #[test]
    fn load_avg_step_shape() {
        // load_avg = (59/60) * load_avg + (1/60) * ready_threads
        let load_avg = Fixed::ZERO;
        let ready_threads = 1;
        let coeff_a = Fixed::from_int(59).div(Fixed::from_int(60));
        let coeff_b = Fixed::from_int(1).div(Fixed::from_int(60));
        let next = coeff_a.mul(load_avg) + coeff_b.mul_int(ready_threads);
        assert!(next.0 > 0);
    }
}
