//! Argument codec (spec §4.6): fixed-width encodings for scalar kinds,
//! length-prefixed encodings for the two variable-length kinds, and the
//! one-time format/caller type cross-check cached per catalog entry.

use once_cell::sync::OnceCell;

use tracekit_common::ArgType;

/// Closed set of encodable argument values; one variant per [`ArgType`].
/// The emit path never produces `Unknown` (no `IntoArg` impl targets it);
/// the decoder can see it if a foreign/corrupt catalog claims that tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    U128(u128),
    I128(i128),
    F32(f32),
    F64(f64),
    String(String),
    Dump(Vec<u8>),
    Pointer(u64),
    Unknown(Vec<u8>),
}

/// A pointer-sized value tagged for the codec, since Rust has no `void*`
/// equivalent that would otherwise pick up a blanket `IntoArg` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer(pub usize);

/// Closed set of types the emit macro can turn into a wire argument
/// (spec §9 "reject at catalog-generation time" -- enforced here by
/// simply not providing a blanket impl, so anything else fails to
/// compile at the call site).
pub trait IntoArg {
    fn arg_type(&self) -> ArgType;
    fn encode_into(&self, out: &mut Vec<u8>);
}

macro_rules! impl_into_arg_fixed {
    ($ty:ty, $tag:expr) => {
        impl IntoArg for $ty {
            fn arg_type(&self) -> ArgType {
                $tag
            }
            fn encode_into(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_into_arg_fixed!(u8, ArgType::U8);
impl_into_arg_fixed!(i8, ArgType::I8);
impl_into_arg_fixed!(u16, ArgType::U16);
impl_into_arg_fixed!(i16, ArgType::I16);
impl_into_arg_fixed!(u32, ArgType::U32);
impl_into_arg_fixed!(i32, ArgType::I32);
impl_into_arg_fixed!(u64, ArgType::U64);
impl_into_arg_fixed!(i64, ArgType::I64);
impl_into_arg_fixed!(u128, ArgType::U128);
impl_into_arg_fixed!(i128, ArgType::I128);
impl_into_arg_fixed!(f32, ArgType::F32);
impl_into_arg_fixed!(f64, ArgType::F64);

impl IntoArg for bool {
    fn arg_type(&self) -> ArgType {
        ArgType::U8
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl IntoArg for char {
    fn arg_type(&self) -> ArgType {
        ArgType::I8
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(*self as i8 as u8);
    }
}

impl IntoArg for Pointer {
    fn arg_type(&self) -> ArgType {
        ArgType::Pointer
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0 as u64).to_le_bytes());
    }
}

/// `NULL` encodes as length=5, bytes `"null\0"` (spec §4.6).
fn encode_string(s: Option<&str>, out: &mut Vec<u8>) {
    match s {
        None => {
            out.extend_from_slice(&5u32.to_le_bytes());
            out.extend_from_slice(b"null\0");
        }
        Some(s) => {
            let len = s.len() as u32 + 1;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
    }
}

impl IntoArg for str {
    fn arg_type(&self) -> ArgType {
        ArgType::String
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        encode_string(Some(self), out);
    }
}

impl IntoArg for String {
    fn arg_type(&self) -> ArgType {
        ArgType::String
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        encode_string(Some(self.as_str()), out);
    }
}

impl<T: IntoArg + ?Sized> IntoArg for Option<&T> {
    fn arg_type(&self) -> ArgType {
        match self {
            Some(v) => v.arg_type(),
            None => ArgType::String,
        }
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Some(v) => v.encode_into(out),
            None => encode_string(None, out),
        }
    }
}

/// A `dump` payload: raw bytes with a label, no terminator (spec §4.5
/// `emit_dump`: payload = 4-byte `n` + `n` bytes).
#[derive(Debug, Clone)]
pub struct Dump<'a>(pub &'a [u8]);

impl IntoArg for Dump<'_> {
    fn arg_type(&self) -> ArgType {
        ArgType::Dump
    }
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.0.len() as u32).to_le_bytes());
        out.extend_from_slice(self.0);
    }
}

/// Decodes one argument of the given `tag` starting at `bytes[0]`.
/// Returns the decoded value and how many bytes it consumed, or `None` on
/// truncation (caller surfaces this as a `FormattingFailed`/size-mismatch
/// error, never panics -- spec §7 "malformed file may only cause the
/// decoder to drop records, never crash").
pub fn decode_arg(tag: ArgType, bytes: &[u8]) -> Option<(ArgValue, usize)> {
    if let Some(width) = tag.fixed_width() {
        let chunk = bytes.get(..width)?;
        let value = match tag {
            ArgType::U8 => ArgValue::U8(chunk[0]),
            ArgType::I8 => ArgValue::I8(chunk[0] as i8),
            ArgType::U16 => ArgValue::U16(u16::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::I16 => ArgValue::I16(i16::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::U32 => ArgValue::U32(u32::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::I32 => ArgValue::I32(i32::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::U64 => ArgValue::U64(u64::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::I64 => ArgValue::I64(i64::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::U128 => ArgValue::U128(u128::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::I128 => ArgValue::I128(i128::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::F32 => ArgValue::F32(f32::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::F64 => ArgValue::F64(f64::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::Pointer => ArgValue::Pointer(u64::from_le_bytes(chunk.try_into().ok()?)),
            ArgType::String | ArgType::Dump | ArgType::Unknown => unreachable!(),
        };
        return Some((value, width));
    }

    match tag {
        ArgType::String => {
            let len = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?) as usize;
            let body = bytes.get(4..4 + len)?;
            let without_nul = body.strip_suffix(&[0]).unwrap_or(body);
            let s = String::from_utf8_lossy(without_nul).into_owned();
            Some((ArgValue::String(s), 4 + len))
        }
        ArgType::Dump => {
            let len = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?) as usize;
            let body = bytes.get(4..4 + len)?.to_vec();
            Some((ArgValue::Dump(body), 4 + len))
        }
        ArgType::Unknown => {
            Some((ArgValue::Unknown(bytes.to_vec()), bytes.len()))
        }
        _ => unreachable!(),
    }
}

/// Result of the one-time format/caller type cross-check (spec §4.6):
/// on mismatch the format-derived tags win, and `flex` records that the
/// effective tags did not come from the caller.
#[derive(Debug, Clone)]
pub struct TypeCheck {
    pub format_derived: Vec<ArgType>,
    pub caller_types: Vec<ArgType>,
    pub flex: bool,
}

/// Parses `%`-directives out of a printf-style format string into their
/// expected [`ArgType`]. Unrecognised directives are skipped (not part of
/// the closed set this codec renders); `%%` is a literal percent.
pub fn format_derived_types(format: &str) -> Vec<ArgType> {
    let mut types = Vec::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        // Skip flags/width/precision modifiers like "%-10.2f" or "%ld".
        let mut long_count = 0usize;
        loop {
            match chars.peek() {
                Some('l') => {
                    long_count += 1;
                    chars.next();
                }
                Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '0' | '.' | '#' | ' ') => {
                    chars.next();
                }
                _ => break,
            }
        }
        match chars.next() {
            Some('%') => {}
            Some('d') | Some('i') => {
                types.push(if long_count > 0 { ArgType::I64 } else { ArgType::I32 })
            }
            Some('u') => types.push(if long_count > 0 { ArgType::U64 } else { ArgType::U32 }),
            Some('x') | Some('X') | Some('o') => {
                types.push(if long_count > 0 { ArgType::U64 } else { ArgType::U32 })
            }
            Some('f') | Some('g') | Some('e') => types.push(ArgType::F64),
            Some('s') => types.push(ArgType::String),
            Some('c') => types.push(ArgType::I8),
            Some('p') => types.push(ArgType::Pointer),
            Some(_) | None => {}
        }
    }
    types
}

/// Computes (or returns the cached) cross-check for a catalog entry's
/// format string against the types the caller actually provided. Callers
/// hold one `OnceCell` per catalog entry so the parse+compare runs once.
pub fn check_or_cache<'a>(
    cache: &'a OnceCell<TypeCheck>,
    format: &str,
    caller_types: &[ArgType],
) -> &'a TypeCheck {
    cache.get_or_init(|| {
        let format_derived = format_derived_types(format);
        let flex = format_derived != caller_types;
        TypeCheck {
            format_derived,
            caller_types: caller_types.to_vec(),
            flex,
        }
    })
}

/// Applies standard printf semantics to `format` and `args`, using
/// whichever tag set `check.flex` selects. Returns `None` when an
/// argument value can't satisfy the directive it lines up with (e.g. a
/// `%s` paired with a `String` value consumed as something else) --
/// surfaced by the decoder as a `FormattingFailed` error.
pub fn render(format: &str, args: &[ArgValue]) -> Option<String> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut arg_iter = args.iter();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        while matches!(
            chars.peek(),
            Some('l') | Some('-') | Some('+') | Some('0') | Some('.') | Some('#') | Some(' ')
        ) || chars.peek().is_some_and(|c| c.is_ascii_digit())
        {
            chars.next();
        }
        match chars.next()? {
            '%' => out.push('%'),
            'd' | 'i' => out.push_str(&format_signed(arg_iter.next()?)?),
            'u' | 'x' | 'X' | 'o' => out.push_str(&format_unsigned(arg_iter.next()?)?),
            'f' | 'g' | 'e' => out.push_str(&format_float(arg_iter.next()?)?),
            's' => out.push_str(&format_string(arg_iter.next()?)?),
            'c' => out.push(format_char(arg_iter.next()?)?),
            'p' => out.push_str(&format_pointer(arg_iter.next()?)?),
            _ => return None,
        }
    }
    Some(out)
}

fn format_signed(v: &ArgValue) -> Option<String> {
    Some(match v {
        ArgValue::I8(n) => n.to_string(),
        ArgValue::I16(n) => n.to_string(),
        ArgValue::I32(n) => n.to_string(),
        ArgValue::I64(n) => n.to_string(),
        ArgValue::I128(n) => n.to_string(),
        ArgValue::U8(n) => n.to_string(),
        ArgValue::U16(n) => n.to_string(),
        ArgValue::U32(n) => n.to_string(),
        ArgValue::U64(n) => n.to_string(),
        ArgValue::U128(n) => n.to_string(),
        _ => return None,
    })
}

fn format_unsigned(v: &ArgValue) -> Option<String> {
    format_signed(v)
}

fn format_float(v: &ArgValue) -> Option<String> {
    Some(match v {
        ArgValue::F32(f) => f.to_string(),
        ArgValue::F64(f) => f.to_string(),
        _ => return None,
    })
}

fn format_string(v: &ArgValue) -> Option<String> {
    match v {
        ArgValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn format_char(v: &ArgValue) -> Option<char> {
    match v {
        ArgValue::I8(n) => Some(*n as u8 as char),
        ArgValue::U8(n) => Some(*n as char),
        _ => None,
    }
}

fn format_pointer(v: &ArgValue) -> Option<String> {
    match v {
        ArgValue::Pointer(p) => Some(format!("0x{p:x}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_round_trips() {
        let mut buf = Vec::new();
        42u32.encode_into(&mut buf);
        assert_eq!(buf.len(), 4);
        let (value, consumed) = decode_arg(ArgType::U32, &buf).unwrap();
        assert_eq!(value, ArgValue::U32(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn string_round_trips_with_nul_terminator() {
        let mut buf = Vec::new();
        "world".encode_into(&mut buf);
        assert_eq!(buf, [6, 0, 0, 0, b'w', b'o', b'r', b'l', b'd', 0]);
        let (value, consumed) = decode_arg(ArgType::String, &buf).unwrap();
        assert_eq!(value, ArgValue::String("world".to_string()));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn null_string_encodes_per_spec() {
        let mut buf = Vec::new();
        let none: Option<&str> = None;
        none.encode_into(&mut buf);
        assert_eq!(buf, [5, 0, 0, 0, b'n', b'u', b'l', b'l', 0]);
    }

    #[test]
    fn dump_round_trips_without_terminator() {
        let mut buf = Vec::new();
        Dump(&[1, 2, 3]).encode_into(&mut buf);
        let (value, consumed) = decode_arg(ArgType::Dump, &buf).unwrap();
        assert_eq!(value, ArgValue::Dump(vec![1, 2, 3]));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn decode_truncated_fixed_width_fails_closed() {
        assert!(decode_arg(ArgType::U64, &[1, 2, 3]).is_none());
    }

    #[test]
    fn decode_truncated_variable_length_fails_closed() {
        assert!(decode_arg(ArgType::String, &[10, 0, 0, 0, b'h', b'i']).is_none());
    }

    #[test]
    fn format_derived_types_matches_directives() {
        let types = format_derived_types("hello %s %u, %d%%");
        assert_eq!(types, vec![ArgType::String, ArgType::U32, ArgType::I32]);
    }

    #[test]
    fn render_hello_world() {
        let args = vec![ArgValue::String("world".to_string()), ArgValue::U32(7)];
        assert_eq!(render("hello %s %u", &args).unwrap(), "hello world 7");
    }

    #[test]
    fn check_or_cache_flags_mismatch() {
        let cell = OnceCell::new();
        let check = check_or_cache(&cell, "%u items", &[ArgType::String]);
        assert!(check.flex);
        assert_eq!(check.format_derived, vec![ArgType::U32]);
        // Second call returns the same cached result without recomputing.
        let again = check_or_cache(&cell, "%u items", &[ArgType::String]);
        assert_eq!(again.format_derived, check.format_derived);
    }
}
