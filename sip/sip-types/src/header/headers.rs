use super::{ConstNamed, DecodeValues, DynNamed, ExtendValues, HeaderError};
use crate::header::name::Name;
use bytesstr::BytesStr;
use std::iter::once;
use std::mem::take;
use std::{fmt, slice};

/// Header map of a SIP message
///
/// A `Vec`-backed multimap storing every value as [`BytesStr`] under its [`Name`],
/// keeping insertion order. Typed access goes through [`DecodeValues`] and [`ExtendValues`].
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<Entry>,
}

impl Headers {
    #[inline]
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|entry| &entry.name == name)
    }

    /// Insert `header` in front of all other headers
    pub fn insert_named_front<H: DynNamed + ExtendValues>(&mut self, header: &H) {
        self.insert_type_front(header.name(), header)
    }

    pub fn insert_type_front<H: ExtendValues>(&mut self, name: Name, header: &H) {
        if let Some(Entry { values, .. }) = self.entry_mut(&name) {
            header.extend_values(values);
        } else {
            self.entries.insert(
                0,
                Entry {
                    name,
                    values: header.create_values(),
                },
            );
        }
    }

    /// Insert a raw header value in front of all other headers
    pub fn insert_front<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        let name = name.into();
        let value = value.into();

        if let Some(Entry { values, .. }) = self.entry_mut(&name) {
            values.push_front(value);
        } else {
            self.entries.insert(
                0,
                Entry {
                    name,
                    values: OneOrMore::One(value),
                },
            );
        }
    }

    /// Insert `header` using its [`DynNamed`] and [`ExtendValues`] implementation
    #[inline]
    pub fn insert_named<H: DynNamed + ExtendValues>(&mut self, header: &H) {
        self.insert_type(header.name(), header)
    }

    pub fn insert_type<H: ExtendValues>(&mut self, name: Name, header: &H) {
        if let Some(Entry { values, .. }) = self.entry_mut(&name) {
            header.extend_values(values);
        } else {
            self.entries.push(Entry {
                name,
                values: header.create_values(),
            });
        }
    }

    /// Append a raw header value
    pub fn insert<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        let name = name.into();
        let value = value.into();

        if let Some(Entry { values, .. }) = self.entry_mut(&name) {
            values.push(value);
        } else {
            self.entries.push(Entry {
                name,
                values: OneOrMore::One(value),
            });
        }
    }

    /// Remove all headers with the given name
    pub fn remove(&mut self, name: &Name) -> Option<Vec<BytesStr>> {
        let Entry { values, .. } = remove_where(&mut self.entries, |entry| &entry.name == name)?;

        match values {
            OneOrMore::One(v) => Some(vec![v]),
            OneOrMore::More(v) => Some(v),
        }
    }

    /// Parse and remove the header `H`, `None` if missing or malformed
    #[inline]
    pub fn take_named<H: ConstNamed + DecodeValues>(&mut self) -> Option<H> {
        self.try_take_named().and_then(Result::ok)
    }

    pub fn try_take_named<H: ConstNamed + DecodeValues>(
        &mut self,
    ) -> Option<Result<H, HeaderError>> {
        remove_where(&mut self.entries, |entry| entry.name == H::NAME)
            .map(|Entry { values, .. }| values.decode(H::NAME))
    }

    #[inline]
    pub fn get_named<H: ConstNamed + DecodeValues>(&self) -> Result<H, HeaderError> {
        match self.try_get_named() {
            Some(res) => res,
            None => Err(HeaderError::Missing(H::NAME)),
        }
    }

    /// Like [`Headers::get_named`] but returns `None` if the header is missing
    #[inline]
    pub fn try_get_named<H: ConstNamed + DecodeValues>(&self) -> Option<Result<H, HeaderError>> {
        Some(self.entry(&H::NAME)?.values.decode(H::NAME))
    }

    pub fn edit_named<H, F>(&mut self, edit: F) -> Result<(), HeaderError>
    where
        H: ConstNamed + DecodeValues + ExtendValues,
        F: FnOnce(&mut H),
    {
        self.edit(H::NAME, edit)
    }

    #[inline]
    pub fn take<H: DecodeValues>(&mut self, name: Name) -> Option<H> {
        self.try_take(name).and_then(Result::ok)
    }

    pub fn try_take<H: DecodeValues>(&mut self, name: Name) -> Option<Result<H, HeaderError>> {
        remove_where(&mut self.entries, |entry| entry.name == name)
            .map(|Entry { values, .. }| values.decode(name))
    }

    pub fn get<H: DecodeValues>(&self, name: Name) -> Result<H, HeaderError> {
        match self.try_get(name.clone()) {
            Some(res) => res,
            None => Err(HeaderError::Missing(name)),
        }
    }

    pub fn try_get<H: DecodeValues>(&self, name: Name) -> Option<Result<H, HeaderError>> {
        Some(self.entry(&name)?.values.decode(name))
    }

    /// Decode the header `name`, edit it and write it back
    pub fn edit<H, F>(&mut self, name: Name, edit: F) -> Result<(), HeaderError>
    where
        H: DecodeValues + ExtendValues,
        F: FnOnce(&mut H),
    {
        let entry = self
            .entry_mut(&name)
            .ok_or_else(|| HeaderError::Missing(name.clone()))?;

        let mut header = entry.values.decode(name)?;

        edit(&mut header);

        entry.values = header.create_values();

        Ok(())
    }

    /// Copy all values of `name` into `dst`
    pub fn clone_into(&self, dst: &mut Self, name: Name) -> Result<(), HeaderError> {
        let Entry { values, .. } = self
            .entry(&name)
            .ok_or_else(|| HeaderError::Missing(name.clone()))?;

        for value in values.iter() {
            dst.insert(name.clone(), value.clone());
        }

        Ok(())
    }

    /// Move all headers into `dst`
    pub fn drain_into(&mut self, dst: &mut Self) {
        for Entry { name, values } in self.entries.drain(..) {
            match values {
                OneOrMore::One(value) => dst.insert(name, value),
                OneOrMore::More(values) => values
                    .into_iter()
                    .for_each(|value| dst.insert(name.clone(), value)),
            }
        }
    }

    /// Iterate over every name-value pair in order
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> + '_ {
        self.entries
            .iter()
            .flat_map(|entry| entry.values.iter().map(move |value| (&entry.name, value)))
    }

    fn entry(&self, n: &Name) -> Option<&Entry> {
        self.entries.iter().find(|Entry { name, .. }| name == n)
    }

    fn entry_mut(&mut self, n: &Name) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|Entry { name, .. }| name == n)
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{name}: {value}\r\n")?;
        }

        Ok(())
    }
}

impl Extend<(Name, BytesStr)> for Headers {
    fn extend<T: IntoIterator<Item = (Name, BytesStr)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    name: Name,
    values: OneOrMore,
}

/// Values stored under a single header name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneOrMore {
    One(BytesStr),
    More(Vec<BytesStr>),
}

impl OneOrMore {
    pub fn push(&mut self, value: BytesStr) {
        match self {
            OneOrMore::One(existing) => {
                let existing = take(existing);
                *self = OneOrMore::More(vec![existing, value]);
            }
            OneOrMore::More(vec) => vec.push(value),
        }
    }

    fn push_front(&mut self, value: BytesStr) {
        match self {
            OneOrMore::One(existing) => {
                let existing = take(existing);
                *self = OneOrMore::More(vec![value, existing]);
            }
            OneOrMore::More(vec) => vec.insert(0, value),
        }
    }

    pub fn last_mut(&mut self) -> Option<&mut BytesStr> {
        match self {
            OneOrMore::One(value) => Some(value),
            OneOrMore::More(values) => values.last_mut(),
        }
    }

    pub fn iter(&self) -> slice::Iter<'_, BytesStr> {
        match self {
            OneOrMore::One(value) => slice::from_ref(value).iter(),
            OneOrMore::More(values) => values.iter(),
        }
    }

    fn decode<H: DecodeValues>(&self, name: Name) -> Result<H, HeaderError> {
        let decoded = match self {
            OneOrMore::One(v) => H::decode(&mut once(v)),
            OneOrMore::More(v) if v.is_empty() => return Err(HeaderError::Missing(name)),
            OneOrMore::More(v) => H::decode(&mut v.iter()),
        };

        decoded.map_err(|err| HeaderError::Malformed(name, err))
    }
}

fn remove_where<T, F>(vec: &mut Vec<T>, f: F) -> Option<T>
where
    F: Fn(&T) -> bool,
{
    vec.iter().position(f).map(|i| vec.remove(i))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::typed::{CSeq, MaxForwards, Via};
    use crate::Method;

    #[test]
    fn insert_appends_values() {
        let mut headers = Headers::new();

        headers.insert(Name::MAX_FORWARDS, "70");
        headers.insert("max-forwards", "69");

        assert_eq!(headers.entries.len(), 1);
        assert_eq!(
            headers.entries[0].values,
            OneOrMore::More(vec![
                BytesStr::from_static("70"),
                BytesStr::from_static("69")
            ])
        );
    }

    #[test]
    fn insert_front_goes_first() {
        let mut headers = Headers::new();

        headers.insert(Name::VIA, "SIP/2.0/WSS b.invalid;branch=z9hG4bK2");
        headers.insert(Name::CALL_ID, "abc");
        headers.insert_front(Name::VIA, "SIP/2.0/WSS a.invalid;branch=z9hG4bK1");

        let vias: Vec<Via> = headers.get_named().unwrap();
        assert_eq!(vias[0].branch().unwrap(), "z9hG4bK1");
        assert_eq!(vias[1].branch().unwrap(), "z9hG4bK2");
    }

    #[test]
    fn take_and_get() {
        let mut headers = Headers::new();
        headers.insert(Name::MAX_FORWARDS, "70");

        let max_fwd: MaxForwards = headers.get_named().unwrap();
        assert_eq!(max_fwd.0, 70);
        assert_eq!(headers.entries.len(), 1);

        let max_fwd: MaxForwards = headers.take_named().unwrap();
        assert_eq!(max_fwd.0, 70);
        assert!(headers.entries.is_empty());

        assert!(headers.get_named::<MaxForwards>().unwrap_err().is_missing());
    }

    #[test]
    fn malformed_header() {
        let mut headers = Headers::new();
        headers.insert(Name::CSEQ, "abc INVITE");

        let err = headers.get_named::<CSeq>().unwrap_err();
        assert!(matches!(err, HeaderError::Malformed(name, _) if name == Name::CSEQ));
    }

    #[test]
    fn edit_named_rewrites_value() {
        let mut headers = Headers::new();
        headers.insert(Name::CSEQ, "1 INVITE");

        headers
            .edit_named(|cseq: &mut CSeq| cseq.cseq += 1)
            .unwrap();

        let cseq: CSeq = headers.get_named().unwrap();
        assert_eq!(cseq, CSeq::new(2, Method::INVITE));
    }

    #[test]
    fn clone_and_drain() {
        let mut headers1 = Headers::new();
        headers1.insert(Name::ROUTE, "<sip:a.invalid;lr>");
        headers1.insert(Name::ROUTE, "<sip:b.invalid;lr>");

        let mut headers2 = Headers::new();
        headers1.clone_into(&mut headers2, Name::ROUTE).unwrap();
        assert_eq!(headers2.iter().count(), 2);

        let mut headers3 = Headers::new();
        headers1.drain_into(&mut headers3);
        assert!(headers1.entries.is_empty());
        assert_eq!(headers3.to_string(), headers2.to_string());
    }

    #[test]
    fn display_keeps_order() {
        let mut headers = Headers::new();
        headers.insert(Name::MAX_FORWARDS, "70");
        headers.insert(Name::VIA, "SIP/2.0/WSS a.invalid;branch=z9hG4bK1");
        headers.insert(Name::CALL_ID, "abc123");
        headers.insert(Name::VIA, "SIP/2.0/WSS b.invalid;branch=z9hG4bK2");

        assert_eq!(
            headers.to_string(),
            "Max-Forwards: 70\r\n\
             Via: SIP/2.0/WSS a.invalid;branch=z9hG4bK1\r\n\
             Via: SIP/2.0/WSS b.invalid;branch=z9hG4bK2\r\n\
             Call-ID: abc123\r\n"
        );
    }
}
