use std::fmt;

use http::header::HeaderName;
use multimap::MultiMap;

use buffet::Piece;

/// A multimap of header names to values.
///
/// Names are case-insensitive (we only ever store lowercase, as required
/// over the wire by HTTP/2), values are opaque bytes.
#[derive(Default, Clone)]
pub struct Headers {
    values: MultiMap<HeaderName, Piece>,
}

impl Headers {
    /// Append a value for a header. Does not replace anything.
    pub fn append(&mut self, name: HeaderName, value: impl Into<Piece>) {
        self.values.insert(name, value.into());
    }

    /// Replace all values for a header with a single one.
    pub fn replace(&mut self, name: HeaderName, value: impl Into<Piece>) {
        self.values.remove(&name);
        self.values.insert(name, value.into());
    }

    /// Returns the first value for a header, if any.
    pub fn get(&self, name: HeaderName) -> Option<&[u8]> {
        self.values.get(&name).map(|piece| &piece[..])
    }

    pub fn contains(&self, name: HeaderName) -> bool {
        self.values.contains_key(&name)
    }

    /// Iterate over every (name, value) pair, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &Piece)> {
        self.values.flat_iter()
    }

    pub fn len(&self) -> usize {
        self.values.flat_iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            match std::str::from_utf8(value) {
                Ok(s) => map.entry(name, &s),
                Err(_) => map.entry(name, &"(non-utf8)"),
            };
        }
        map.finish()
    }
}

pub trait HeadersExt {
    /// Returns the parsed `content-length` header
    fn content_length(&self) -> Option<u64>;
}

impl HeadersExt for Headers {
    fn content_length(&self) -> Option<u64> {
        let value = self.get(http::header::CONTENT_LENGTH)?;
        std::str::from_utf8(value).ok()?.parse().ok()
    }
}
