use core::fmt::{Debug, Display};
use core::ops::{Add, Sub};
use core::str::FromStr;

use crate::ParseDecimalError;

/// Holds up to 9 digits of integer and 9 digits of fraction data.
///
/// The main goal of this type is to exactly represent a gcode real value:
/// parsing a number and then re-stringifying it should produce an equal
/// value aside from minor formatting differences (leading zeros, trailing
/// dot).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    value: i64,
}

impl Decimal {
    /// Number of units needed to form a whole integer.
    ///
    /// Chosen to give around half of the i64 bits to the fraction part of
    /// the number representation.
    ///
    /// 2^31 = 2147483648
    ///        1000000000 <- this value
    const UNITS_PER_INTEGER: i64 = 1_000_000_000;

    pub const ZERO: Decimal = Decimal { value: 0 };

    fn is_nonnegative(&self) -> bool {
        self.value >= 0
    }

    pub fn parse_complete(data: &[u8]) -> Option<Self> {
        match Self::parse(data) {
            Some((v, b"")) => Some(v),
            _ => None,
        }
    }

    /// Parses a decimal in human readable ASCII form from some bytes.
    ///
    /// Returns the parsed decimal and any bytes remaining after it.
    pub fn parse(mut data: &[u8]) -> Option<(Self, &[u8])> {
        let mut sign = 1;
        let mut num_digits = 0;

        if !data.is_empty() {
            match data[0] {
                b'+' => {
                    sign = 1;
                    data = &data[1..];
                }
                b'-' => {
                    sign = -1;
                    data = &data[1..];
                }
                _ => {}
            }
        }

        let mut integer: i64 = 0;
        while !data.is_empty() {
            let digit = data[0];
            if !digit.is_ascii_digit() {
                break;
            }

            if num_digits == 9 {
                return None;
            }

            let v = (digit - b'0') as i64;
            integer = 10 * integer + v;
            num_digits += 1;
            data = &data[1..];
        }

        let mut num_dots = 0;
        while !data.is_empty() && data[0] == b'.' {
            num_dots += 1;
            data = &data[1..];
        }

        let mut fraction: i64 = 0;
        if num_dots > 0 {
            let mut overflow = false;

            fraction = match Self::parse_fraction(data, &mut num_digits, &mut overflow) {
                Some((v, r)) => {
                    data = r;
                    v
                }
                None => 0,
            };

            if overflow {
                return None;
            }
        }

        if num_digits == 0 {
            return None;
        }

        integer *= sign;
        fraction *= sign;

        let v = Self {
            value: integer * Self::UNITS_PER_INTEGER + fraction,
        };

        Some((v, data))
    }

    fn parse_fraction<'a>(
        mut digits: &'a [u8],
        num_digits: &mut usize,
        overflow: &mut bool,
    ) -> Option<(i64, &'a [u8])> {
        let mut value = 0;
        let mut scale = Self::UNITS_PER_INTEGER;

        while !digits.is_empty() {
            let digit = digits[0];

            scale /= 10;
            if scale == 0 {
                *overflow = true;
                return None;
            }

            let v = {
                if !digit.is_ascii_digit() {
                    break;
                }
                (digit - b'0') as i64
            };

            value += v * scale;
            digits = &digits[1..];
            *num_digits += 1;
        }

        Some((value, digits))
    }

    fn stringify_fraction(&self, out: &mut String) {
        let mut frac = self.value.abs() % Self::UNITS_PER_INTEGER;

        if frac != 0 {
            out.push('.');
        }

        let mut scale = Self::UNITS_PER_INTEGER;
        while frac > 0 {
            scale /= 10;
            let digit = frac / scale;
            out.push((b'0' + (digit as u8)) as char);
            frac -= scale * digit;
        }
    }

    pub fn to_f32(&self) -> f32 {
        self.to_string().parse::<f32>().unwrap()
    }

    pub fn to_f64(&self) -> f64 {
        self.to_string().parse::<f64>().unwrap()
    }
}

impl From<i32> for Decimal {
    fn from(value: i32) -> Self {
        Self {
            value: (value as i64) * Self::UNITS_PER_INTEGER,
        }
    }
}

impl From<f32> for Decimal {
    fn from(value: f32) -> Self {
        let integer = (value as i64) * Self::UNITS_PER_INTEGER;
        let fraction = (value.fract() * (Self::UNITS_PER_INTEGER as f32)) as i64;
        Self {
            value: integer + fraction,
        }
    }
}

impl Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let int = self.value / Self::UNITS_PER_INTEGER;

        f.pad_integral(self.is_nonnegative(), "", &int.abs().to_string())?;

        let mut frac = String::new();
        self.stringify_fraction(&mut frac);
        write!(f, "{}", frac)
    }
}

impl Debug for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse(s.as_bytes()) {
            Some((v, b"")) => Ok(v),
            _ => Err(ParseDecimalError),
        }
    }
}

impl Add for Decimal {
    type Output = Decimal;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.value += rhs.value;
        self
    }
}

impl Sub for Decimal {
    type Output = Self;

    fn sub(mut self, rhs: Self) -> Self::Output {
        self.value -= rhs.value;
        self
    }
}
