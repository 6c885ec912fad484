//! Runtime `(oid, format) -> decoder` dispatch, layered over a global default.
//!
//! [`FromWireValue`](super::FromWireValue)/[`FromRow`](super::FromRow) decode
//! through compile-time generics and cover the common case of "I know the
//! Rust type I want". This module is the companion runtime path for callers
//! that only know an OID at runtime (generic tooling, REPLs, introspection):
//! a per-session map of decoders, falling back to a process-wide global map,
//! falling back to raw bytes (binary) or the untouched text (text) when
//! nothing is registered for that OID and format.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::Result;
use crate::protocol::types::{FormatCode, Oid};

/// What a registered decoder produces.
///
/// Decoders are free to return whichever variant fits; most will parse into
/// [`DecodedValue::Text`] (a custom rendering) or pass bytes through as
/// [`DecodedValue::Bytes`]. `Null` is produced by the dispatch helper itself
/// for NULL columns and is never something a decoder needs to construct by
/// hand for that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedValue {
    /// Column was SQL NULL.
    Null,
    /// A textual rendering of the value.
    Text(String),
    /// The value's raw, undecoded bytes.
    Bytes(Vec<u8>),
}

/// A registered decoder: raw column bytes (never NULL; NULL is handled before
/// a decoder is invoked) in, a [`DecodedValue`] or a decode error out.
pub type TypeParser = Arc<dyn Fn(&[u8]) -> Result<DecodedValue> + Send + Sync>;

/// Per-session `(oid, format) -> decoder` overrides.
///
/// Cheap to clone: entries are `Arc`-shared, so handing a snapshot to a
/// result-assembly handler is just a `HashMap` of pointer clones.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    parsers: HashMap<(Oid, FormatCode), TypeParser>,
}

impl TypeRegistry {
    /// An empty registry: every lookup falls through to the global default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the decoder used for `(oid, format)`.
    pub fn set<F>(&mut self, oid: Oid, format: FormatCode, parser: F)
    where
        F: Fn(&[u8]) -> Result<DecodedValue> + Send + Sync + 'static,
    {
        self.parsers.insert((oid, format), Arc::new(parser));
    }

    /// Look up the decoder registered directly on this registry, if any.
    ///
    /// Does not consult the global default; callers wanting the full
    /// session-then-global resolution should use [`decode_column`].
    pub fn get(&self, oid: Oid, format: FormatCode) -> Option<TypeParser> {
        self.parsers.get(&(oid, format)).cloned()
    }
}

/// Process-wide default decoders, consulted when a session has none
/// registered for a given `(oid, format)`.
static GLOBAL_TYPE_PARSERS: LazyLock<RwLock<HashMap<(Oid, FormatCode), TypeParser>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register (or replace) a process-wide default decoder for `(oid, format)`.
///
/// Sessions that haven't called [`TypeRegistry::set`] for the same
/// `(oid, format)` will use this decoder.
pub fn set_global_type_parser<F>(oid: Oid, format: FormatCode, parser: F)
where
    F: Fn(&[u8]) -> Result<DecodedValue> + Send + Sync + 'static,
{
    #[allow(clippy::unwrap_used)]
    GLOBAL_TYPE_PARSERS
        .write()
        .unwrap()
        .insert((oid, format), Arc::new(parser));
}

/// Look up the process-wide default decoder for `(oid, format)`, if any.
pub fn get_global_type_parser(oid: Oid, format: FormatCode) -> Option<TypeParser> {
    #[allow(clippy::unwrap_used)]
    GLOBAL_TYPE_PARSERS.read().unwrap().get(&(oid, format)).cloned()
}

/// Decode one column's raw bytes through the full resolution chain: `session`
/// first, then the global default, then the built-in fallback (raw bytes for
/// binary format, the untouched UTF-8 text otherwise).
///
/// `bytes` is `None` for a NULL column, which always decodes to
/// [`DecodedValue::Null`] without consulting any decoder.
pub fn decode_column(
    session: &TypeRegistry,
    oid: Oid,
    format: FormatCode,
    bytes: Option<&[u8]>,
) -> Result<DecodedValue> {
    let Some(bytes) = bytes else {
        return Ok(DecodedValue::Null);
    };

    if let Some(parser) = session.get(oid, format).or_else(|| get_global_type_parser(oid, format))
    {
        return parser(bytes);
    }

    Ok(match format {
        FormatCode::Binary => DecodedValue::Bytes(bytes.to_vec()),
        FormatCode::Text => DecodedValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    #[test]
    fn miss_falls_back_to_text() {
        let registry = TypeRegistry::new();
        let decoded = decode_column(&registry, oid::INT4, FormatCode::Text, Some(b"42")).unwrap();
        assert_eq!(decoded, DecodedValue::Text("42".into()));
    }

    #[test]
    fn miss_falls_back_to_raw_bytes_in_binary_format() {
        let registry = TypeRegistry::new();
        let decoded =
            decode_column(&registry, oid::INT4, FormatCode::Binary, Some(&[0, 0, 0, 42])).unwrap();
        assert_eq!(decoded, DecodedValue::Bytes(vec![0, 0, 0, 42]));
    }

    #[test]
    fn null_never_reaches_a_decoder() {
        let registry = TypeRegistry::new();
        let decoded = decode_column(&registry, oid::INT4, FormatCode::Text, None).unwrap();
        assert_eq!(decoded, DecodedValue::Null);
    }

    #[test]
    fn session_override_wins_over_global() {
        set_global_type_parser(oid::TEXT_ARRAY, FormatCode::Text, |_bytes| {
            Ok(DecodedValue::Text("global".into()))
        });

        let mut session = TypeRegistry::new();
        session.set(oid::TEXT_ARRAY, FormatCode::Text, |_bytes| {
            Ok(DecodedValue::Text("session".into()))
        });

        let decoded =
            decode_column(&session, oid::TEXT_ARRAY, FormatCode::Text, Some(b"{a,b}")).unwrap();
        assert_eq!(decoded, DecodedValue::Text("session".into()));
    }

    #[test]
    fn global_default_applies_when_session_has_none() {
        set_global_type_parser(oid::BOOL, FormatCode::Text, |bytes| {
            Ok(DecodedValue::Text(if bytes == b"t" { "yes".into() } else { "no".into() }))
        });

        let session = TypeRegistry::new();
        let decoded = decode_column(&session, oid::BOOL, FormatCode::Text, Some(b"t")).unwrap();
        assert_eq!(decoded, DecodedValue::Text("yes".into()));
    }
}
