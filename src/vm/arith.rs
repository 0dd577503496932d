//! Arithmetic, bitwise, and comparison primitives over `LuaValue`, plus
//! the numeral-coercion rules arithmetic and concatenation both need.
//!
//! Every function here is a pure value-level operation that returns
//! `None` when the operands don't support it numerically — the VM's
//! dispatch loop is the one that turns a `None` into a metamethod
//! lookup or, failing that, a `RuntimeError`. Nothing in this module
//! raises.

use crate::lexer::{is_hex_digit, parse_hex_float, parse_hex_int};
use crate::value::LuaValue;

/// Parses a byte string as a Lua numeral, the same grammar `read_number`
/// accepts (decimal/hex, int/float), plus leading/trailing whitespace and
/// an optional sign — matching `luaO_str2d`/`luaO_str2int`'s looser
/// top-level grammar (used for `tonumber`/arithmetic string coercion,
/// not for lexing source).
pub fn str_to_number(bytes: &[u8]) -> Option<LuaValue> {
    let s = std::str::from_utf8(bytes).ok()?;
    let trimmed = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if trimmed.is_empty() {
        return None;
    }
    let (neg, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if body.is_empty() {
        return None;
    }
    if let Some(hex_digits) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex_digits.is_empty() {
            return None;
        }
        if hex_digits.contains('.') || hex_digits.contains('p') || hex_digits.contains('P') {
            let f = parse_hex_float(body)?;
            return Some(LuaValue::Float(if neg { -f } else { f }));
        }
        if !hex_digits.bytes().all(is_hex_digit) {
            return None;
        }
        let i = parse_hex_int(hex_digits);
        return Some(LuaValue::Int(if neg { i.wrapping_neg() } else { i }));
    }
    if let Ok(i) = body.parse::<i64>() {
        return Some(LuaValue::Int(if neg { i.wrapping_neg() } else { i }));
    }
    let f: f64 = body.parse().ok()?;
    if !looks_like_number(body) {
        return None;
    }
    Some(LuaValue::Float(if neg { -f } else { f }))
}

/// Rust's `f64::from_str` accepts spellings Lua doesn't (`inf`, `NaN`,
/// leading `.` is fine but things like `1_000` or a bare exponent are
/// not numerals Lua would lex) — reject the ones that would silently
/// round-trip through `parse::<f64>()` without being valid Lua source.
fn looks_like_number(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
        && s.bytes().any(|b| b.is_ascii_digit())
}

fn as_numbers(a: &LuaValue, b: &LuaValue) -> Option<(LuaValue, LuaValue)> {
    Some((a.coerce_to_number()?, b.coerce_to_number()?))
}

/// Floor division of integers: `q` such that `q*b <= a < (q+1)*b`
/// (b>0) — i.e. rounds toward negative infinity, unlike Rust's
/// truncating `/`. Panics are avoided by the caller checking `b != 0`
/// first.
fn ifloordiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Lua's integer `%`: `a - floor(a/b)*b`, always the same sign as `b`.
fn imod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

fn fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

macro_rules! arith_op {
    ($name:ident, $int_op:expr, $float_op:expr) => {
        pub fn $name(a: &LuaValue, b: &LuaValue) -> Option<LuaValue> {
            let (a, b) = as_numbers(a, b)?;
            match (a, b) {
                (LuaValue::Int(x), LuaValue::Int(y)) => Some(LuaValue::Int($int_op(x, y))),
                (a, b) => {
                    let x = a.as_f64()?;
                    let y = b.as_f64()?;
                    Some(LuaValue::Float($float_op(x, y)))
                }
            }
        }
    };
}

arith_op!(add, i64::wrapping_add, |x: f64, y: f64| x + y);
arith_op!(sub, i64::wrapping_sub, |x: f64, y: f64| x - y);
arith_op!(mul, i64::wrapping_mul, |x: f64, y: f64| x * y);

/// `/` always produces a float in Lua 5.3, even for two integers.
pub fn div(a: &LuaValue, b: &LuaValue) -> Option<LuaValue> {
    let (a, b) = as_numbers(a, b)?;
    Some(LuaValue::Float(a.as_f64()? / b.as_f64()?))
}

/// `^` always produces a float.
pub fn pow(a: &LuaValue, b: &LuaValue) -> Option<LuaValue> {
    let (a, b) = as_numbers(a, b)?;
    Some(LuaValue::Float(a.as_f64()?.powf(b.as_f64()?)))
}

pub fn idiv(a: &LuaValue, b: &LuaValue) -> Result<Option<LuaValue>, &'static str> {
    let Some((a, b)) = as_numbers(a, b) else { return Ok(None) };
    match (a, b) {
        (LuaValue::Int(x), LuaValue::Int(y)) => {
            if y == 0 {
                Err("attempt to perform 'n//0'")
            } else {
                Ok(Some(LuaValue::Int(ifloordiv(x, y))))
            }
        }
        (a, b) => Ok(Some(LuaValue::Float((a.as_f64().unwrap() / b.as_f64().unwrap()).floor()))),
    }
}

pub fn modulo(a: &LuaValue, b: &LuaValue) -> Result<Option<LuaValue>, &'static str> {
    let Some((a, b)) = as_numbers(a, b) else { return Ok(None) };
    match (a, b) {
        (LuaValue::Int(x), LuaValue::Int(y)) => {
            if y == 0 {
                Err("attempt to perform 'n%%0'")
            } else {
                Ok(Some(LuaValue::Int(imod(x, y))))
            }
        }
        (a, b) => Ok(Some(LuaValue::Float(fmod(a.as_f64().unwrap(), b.as_f64().unwrap())))),
    }
}

pub fn unm(a: &LuaValue) -> Option<LuaValue> {
    match a.coerce_to_number()? {
        LuaValue::Int(i) => Some(LuaValue::Int(i.wrapping_neg())),
        LuaValue::Float(f) => Some(LuaValue::Float(-f)),
        _ => None,
    }
}

/// A float converts to an integer only when it has an exact integer
/// value representable in `i64` — used by every bitwise op (spec
/// §4.5: "float operands must be exact integers, else raise").
pub fn to_integer_exact(v: &LuaValue) -> Option<i64> {
    match v.coerce_to_number()? {
        LuaValue::Int(i) => Some(i),
        LuaValue::Float(f) => {
            if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Distinguishes "not numbers at all" (try a metamethod) from "numbers,
/// but a float isn't exactly representable as an integer" (a hard
/// error even when a metamethod exists, matching `luaT_trybiniTM`).
pub enum BitwiseError {
    NotNumbers,
    NoIntegerRepresentation,
}

fn bitwise_operands(a: &LuaValue, b: &LuaValue) -> Result<(i64, i64), BitwiseError> {
    if a.coerce_to_number().is_none() || b.coerce_to_number().is_none() {
        return Err(BitwiseError::NotNumbers);
    }
    let x = to_integer_exact(a).ok_or(BitwiseError::NoIntegerRepresentation)?;
    let y = to_integer_exact(b).ok_or(BitwiseError::NoIntegerRepresentation)?;
    Ok((x, y))
}

macro_rules! bitwise_op {
    ($name:ident, $op:expr) => {
        pub fn $name(a: &LuaValue, b: &LuaValue) -> Result<LuaValue, BitwiseError> {
            let (x, y) = bitwise_operands(a, b)?;
            Ok(LuaValue::Int($op(x, y)))
        }
    };
}

bitwise_op!(band, |x: i64, y: i64| x & y);
bitwise_op!(bor, |x: i64, y: i64| x | y);
bitwise_op!(bxor, |x: i64, y: i64| x ^ y);

/// Shifts are defined modulo 64 with a shift of 64 or more (in either
/// direction) producing `0`; a negative shift amount reverses direction.
fn shift_left(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((a as u64) << n) as i64
    } else {
        ((a as u64) >> (-n)) as i64
    }
}

pub fn shl(a: &LuaValue, b: &LuaValue) -> Result<LuaValue, BitwiseError> {
    let (x, y) = bitwise_operands(a, b)?;
    Ok(LuaValue::Int(shift_left(x, y)))
}

pub fn shr(a: &LuaValue, b: &LuaValue) -> Result<LuaValue, BitwiseError> {
    let (x, y) = bitwise_operands(a, b)?;
    Ok(LuaValue::Int(shift_left(x, y.checked_neg().unwrap_or(i64::MAX))))
}

pub fn bnot(a: &LuaValue) -> Result<LuaValue, BitwiseError> {
    if a.coerce_to_number().is_none() {
        return Err(BitwiseError::NotNumbers);
    }
    let x = to_integer_exact(a).ok_or(BitwiseError::NoIntegerRepresentation)?;
    Ok(LuaValue::Int(!x))
}

/// Numeric/string `<`. `None` means the operands are incomparable this
/// way (mixed number/string, or anything else) and the VM should fall
/// back to `__lt` or raise.
pub fn less_than(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    match (a, b) {
        (LuaValue::Int(x), LuaValue::Int(y)) => Some(x < y),
        (LuaValue::Str(x), LuaValue::Str(y)) => Some(x.as_bytes() < y.as_bytes()),
        _ => {
            let x = a.as_f64()?;
            let y = b.as_f64()?;
            Some(x < y)
        }
    }
}

pub fn less_equal(a: &LuaValue, b: &LuaValue) -> Option<bool> {
    match (a, b) {
        (LuaValue::Int(x), LuaValue::Int(y)) => Some(x <= y),
        (LuaValue::Str(x), LuaValue::Str(y)) => Some(x.as_bytes() <= y.as_bytes()),
        _ => {
            let x = a.as_f64()?;
            let y = b.as_f64()?;
            Some(x <= y)
        }
    }
}

/// Converts a value to the bytes `CONCAT` would use for it directly
/// (numbers and strings only — anything else needs `__concat`).
pub fn concat_bytes(v: &LuaValue) -> Option<Vec<u8>> {
    match v {
        LuaValue::Str(s) => Some(s.as_bytes().to_vec()),
        LuaValue::Int(i) => {
            let mut buf = itoa::Buffer::new();
            Some(buf.format(*i).as_bytes().to_vec())
        }
        LuaValue::Float(f) => Some(format_float(*f).into_bytes()),
        _ => None,
    }
}

/// `tostring` formatting for numbers: Lua prints floats with `%.14g`
/// and always shows a decimal point or exponent so a float never reads
/// back as an integer literal.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf".to_string() } else { "inf".to_string() };
    }
    format_g(f, 14)
}

/// A small `%.<prec>g`-equivalent: shortest decimal representation with
/// up to `prec` significant digits, falling back to exponential form
/// outside `1e-4..1e<prec>`, matching C's `%g` (and thus Lua's
/// `LUAI_NUMFFORMAT`).
fn format_g(f: f64, prec: usize) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0".to_string() } else { "0.0".to_string() };
    }
    let mut s = format!("{:.*e}", prec.saturating_sub(1), f);
    // Rust's `{:e}` gives "1.2345e2"; split mantissa/exponent and decide
    // fixed vs. exponential the way `%g` does.
    let epos = s.find('e').unwrap();
    let exp: i32 = s[epos + 1..].parse().unwrap();
    if (-4..(prec as i32)).contains(&exp) {
        s = format!("{:.*}", (prec as i32 - 1 - exp).max(0) as usize, f);
        trim_trailing_zeros(&mut s);
        if !s.contains('.') {
            s.push_str(".0");
        }
    } else {
        let mantissa = &s[..epos];
        let mut mantissa = mantissa.to_string();
        trim_trailing_zeros(&mut mantissa);
        s = format!("{}e{}{:02}", mantissa, if exp >= 0 { "+" } else { "-" }, exp.abs());
    }
    s
}

fn trim_trailing_zeros(s: &mut String) {
    if !s.contains('.') {
        return;
    }
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_to_number_decimal() {
        assert!(matches!(str_to_number(b"42"), Some(LuaValue::Int(42))));
        assert!(matches!(str_to_number(b"  -3.5 "), Some(LuaValue::Float(f)) if f == -3.5));
    }

    #[test]
    fn str_to_number_hex() {
        assert!(matches!(str_to_number(b"0x10"), Some(LuaValue::Int(16))));
    }

    #[test]
    fn str_to_number_rejects_garbage() {
        assert!(str_to_number(b"3x").is_none());
        assert!(str_to_number(b"").is_none());
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        match idiv(&LuaValue::Int(7), &LuaValue::Int(-2)) {
            Ok(Some(LuaValue::Int(q))) => assert_eq!(q, -4),
            _ => panic!("expected integer floor division"),
        }
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        match modulo(&LuaValue::Int(7), &LuaValue::Int(-2)) {
            Ok(Some(LuaValue::Int(r))) => assert_eq!(r, -1),
            _ => panic!("expected integer modulo"),
        }
    }

    #[test]
    fn integer_overflow_wraps() {
        let max = LuaValue::Int(i64::MAX);
        match add(&max, &LuaValue::Int(1)) {
            Some(LuaValue::Int(i)) => assert_eq!(i, i64::MIN),
            _ => panic!("expected wrapping add"),
        }
    }

    #[test]
    fn bitwise_rejects_non_integral_float() {
        assert!(matches!(band(&LuaValue::Float(1.5), &LuaValue::Int(1)), Err(BitwiseError::NoIntegerRepresentation)));
    }

    #[test]
    fn shift_reverses_on_negative_amount() {
        assert_eq!(shift_left(1, -1), 0);
        assert_eq!(shift_left(2, -1), 1);
    }
}
