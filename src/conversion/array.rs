//! Array parameter encoding via PostgreSQL's text array-literal syntax.
//!
//! PostgreSQL's binary array format repeats metadata (dimensions, element OID,
//! lower bounds) that the text literal conveys implicitly and that every
//! element type here already has a text representation for, so array
//! parameters are always bound in text format: the server parses the literal
//! against whatever array type the target OID names. This mirrors how
//! higher-level PostgreSQL clients commonly bind arrays, and sidesteps the
//! open question of binary array framing for composite element types.

use crate::protocol::types::{FormatCode, Oid, array_oid_for_element, oid};

use super::ToWireValue;
use crate::error::Result;

/// A value that can appear as an element inside an array literal.
trait ArrayElement {
    /// The scalar OID of one element (e.g. `i32` -> `oid::INT4`).
    fn element_oid() -> Oid;

    /// Append this value's literal text to `out`.
    fn literal_text(&self, out: &mut String);
}

impl ArrayElement for bool {
    fn element_oid() -> Oid {
        oid::BOOL
    }

    fn literal_text(&self, out: &mut String) {
        out.push(if *self { 't' } else { 'f' });
    }
}

macro_rules! impl_array_element_number {
    ($($t:ty => $oid:path),+ $(,)?) => {
        $(
            impl ArrayElement for $t {
                fn element_oid() -> Oid {
                    $oid
                }

                fn literal_text(&self, out: &mut String) {
                    out.push_str(&self.to_string());
                }
            }
        )+
    };
}

impl_array_element_number!(
    i16 => oid::INT2,
    i32 => oid::INT4,
    i64 => oid::INT8,
    f32 => oid::FLOAT4,
    f64 => oid::FLOAT8,
);

impl ArrayElement for String {
    fn element_oid() -> Oid {
        oid::TEXT
    }

    fn literal_text(&self, out: &mut String) {
        quote_array_text(self, out);
    }
}

/// Quote and escape a textual array element: wrap in `"..."`, doubling `\` and `"`.
fn quote_array_text(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

impl<T: ArrayElement> ArrayElement for Option<T> {
    fn element_oid() -> Oid {
        T::element_oid()
    }

    fn literal_text(&self, out: &mut String) {
        match self {
            Some(v) => v.literal_text(out),
            None => out.push_str("NULL"),
        }
    }
}

impl<T: ArrayElement> ArrayElement for Vec<T> {
    fn element_oid() -> Oid {
        T::element_oid()
    }

    fn literal_text(&self, out: &mut String) {
        out.push('{');
        for (i, v) in self.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            v.literal_text(out);
        }
        out.push('}');
    }
}

macro_rules! impl_to_wire_value_array {
    ($($t:ty),+ $(,)?) => {
        $(
            impl ToWireValue for Vec<$t> {
                fn natural_oid(&self) -> Oid {
                    array_oid_for_element(<$t as ArrayElement>::element_oid())
                        .unwrap_or(oid::TEXT_ARRAY)
                }

                fn preferred_format(&self) -> FormatCode {
                    FormatCode::Text
                }

                fn encode(&self, _target_oid: Oid, buf: &mut Vec<u8>) -> Result<()> {
                    let mut literal = String::new();
                    ArrayElement::literal_text(self, &mut literal);
                    buf.extend_from_slice(&(literal.len() as i32).to_be_bytes());
                    buf.extend_from_slice(literal.as_bytes());
                    Ok(())
                }
            }
        )+
    };
}

impl_to_wire_value_array!(
    bool,
    i16,
    i32,
    i64,
    f32,
    f64,
    String,
    Option<bool>,
    Option<i16>,
    Option<i32>,
    Option<i64>,
    Option<f32>,
    Option<f64>,
    Option<String>,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_of<T: ArrayElement>(v: &Vec<T>) -> String {
        let mut s = String::new();
        v.literal_text(&mut s);
        s
    }

    #[test]
    fn ints_literal() {
        assert_eq!(literal_of(&vec![1_i32, 2, 3]), "{1,2,3}");
    }

    #[test]
    fn mixed_nulls_and_integers() {
        let v: Vec<Option<i32>> = vec![Some(1), None, Some(2)];
        assert_eq!(literal_of(&v), "{1,NULL,2}");
    }

    #[test]
    fn strings_are_quoted_and_escaped() {
        let v = vec!["a\"b".to_string(), "c\\d".to_string()];
        assert_eq!(literal_of(&v), r#"{"a\"b","c\\d"}"#);
    }

    #[test]
    fn nested_arrays() {
        let v = vec![vec![1_i32, 2], vec![3, 4]];
        assert_eq!(literal_of(&v), "{{1,2},{3,4}}");
    }

    #[test]
    fn empty_array() {
        let v: Vec<i32> = vec![];
        assert_eq!(literal_of(&v), "{}");
    }

    #[test]
    fn encode_writes_length_prefixed_text() {
        let v = vec![1_i32, 2, 3];
        let mut buf = Vec::new();
        v.encode(v.natural_oid(), &mut buf).unwrap();
        let len = i32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(&buf[4..4 + len], b"{1,2,3}");
        assert_eq!(v.natural_oid(), oid::INT4_ARRAY);
        assert_eq!(v.preferred_format(), FormatCode::Text);
    }
}
