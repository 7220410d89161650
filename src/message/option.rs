use std::collections::btree_map::{BTreeMap, Entry};
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{EncodingError, UnknownCriticalOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    NoResponse,
    Unknown(u16),
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            258 => CoapOption::NoResponse,
            _ => CoapOption::Unknown(number),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::NoResponse => 258,
            CoapOption::Unknown(number) => number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Empty,
    Opaque,
    Uint,
    String,
}

/// Static properties of a registered option number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDefinition {
    pub name: &'static str,
    pub repeatable: bool,
    pub format: OptionFormat,
    pub length: RangeInclusive<usize>,
}

impl CoapOption {
    pub fn number(self) -> u16 {
        u16::from(self)
    }

    pub fn is_critical(self) -> bool {
        self.number() & 0x01 != 0
    }

    pub fn is_unsafe(self) -> bool {
        self.number() & 0x02 != 0
    }

    pub fn is_no_cache_key(self) -> bool {
        self.number() & 0x1E == 0x1C
    }

    /// The registered definition, `None` for numbers the engine does not know.
    pub fn definition(self) -> Option<OptionDefinition> {
        use OptionFormat::*;
        let (name, repeatable, format, length) = match self {
            CoapOption::IfMatch => ("If-Match", true, Opaque, 0..=8),
            CoapOption::UriHost => ("Uri-Host", false, String, 1..=255),
            CoapOption::ETag => ("ETag", true, Opaque, 1..=8),
            CoapOption::IfNoneMatch => ("If-None-Match", false, Empty, 0..=0),
            CoapOption::Observe => ("Observe", false, Uint, 0..=3),
            CoapOption::UriPort => ("Uri-Port", false, Uint, 0..=2),
            CoapOption::LocationPath => ("Location-Path", true, String, 0..=255),
            CoapOption::UriPath => ("Uri-Path", true, String, 0..=255),
            CoapOption::ContentFormat => ("Content-Format", false, Uint, 0..=2),
            CoapOption::MaxAge => ("Max-Age", false, Uint, 0..=4),
            CoapOption::UriQuery => ("Uri-Query", true, String, 0..=255),
            CoapOption::Accept => ("Accept", false, Uint, 0..=2),
            CoapOption::LocationQuery => ("Location-Query", true, String, 0..=255),
            CoapOption::Block2 => ("Block2", false, Uint, 0..=3),
            CoapOption::Block1 => ("Block1", false, Uint, 0..=3),
            CoapOption::Size2 => ("Size2", false, Uint, 0..=4),
            CoapOption::ProxyUri => ("Proxy-Uri", false, String, 1..=1034),
            CoapOption::ProxyScheme => ("Proxy-Scheme", false, String, 1..=255),
            CoapOption::Size1 => ("Size1", false, Uint, 0..=4),
            CoapOption::NoResponse => ("No-Response", false, Uint, 0..=1),
            CoapOption::Unknown(_) => return None,
        };
        Some(OptionDefinition {
            name,
            repeatable,
            format,
            length,
        })
    }

    pub fn is_repeatable(self) -> bool {
        self.definition().map_or(true, |d| d.repeatable)
    }
}

/// Registered Content-Format values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain,
    ApplicationLinkFormat,
    ApplicationXML,
    ApplicationOctetStream,
    ApplicationEXI,
    ApplicationJSON,
    ApplicationCBOR,
    ApplicationSenmlJSON,
    ApplicationSenmlCBOR,
    Other(u16),
}

impl From<u16> for ContentFormat {
    fn from(value: u16) -> ContentFormat {
        match value {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::ApplicationLinkFormat,
            41 => ContentFormat::ApplicationXML,
            42 => ContentFormat::ApplicationOctetStream,
            47 => ContentFormat::ApplicationEXI,
            50 => ContentFormat::ApplicationJSON,
            60 => ContentFormat::ApplicationCBOR,
            110 => ContentFormat::ApplicationSenmlJSON,
            112 => ContentFormat::ApplicationSenmlCBOR,
            other => ContentFormat::Other(other),
        }
    }
}

impl From<ContentFormat> for u16 {
    fn from(format: ContentFormat) -> u16 {
        match format {
            ContentFormat::TextPlain => 0,
            ContentFormat::ApplicationLinkFormat => 40,
            ContentFormat::ApplicationXML => 41,
            ContentFormat::ApplicationOctetStream => 42,
            ContentFormat::ApplicationEXI => 47,
            ContentFormat::ApplicationJSON => 50,
            ContentFormat::ApplicationCBOR => 60,
            ContentFormat::ApplicationSenmlJSON => 110,
            ContentFormat::ApplicationSenmlCBOR => 112,
            ContentFormat::Other(other) => other,
        }
    }
}

/// Encodes an unsigned option value in the fewest big-endian bytes.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an unsigned option value of at most four bytes.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

/// Options of a message, kept in ascending number order.
///
/// Values of a repeated option keep the order in which they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionTable {
    options: BTreeMap<u16, Vec<Vec<u8>>>,
}

impl OptionTable {
    pub fn new() -> OptionTable {
        OptionTable::default()
    }

    /// Appends a value after any existing values of the option.
    pub fn add(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.entry(option.number()).or_default().push(value);
    }

    /// Replaces every value of the option with a single one.
    pub fn set(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.insert(option.number(), vec![value]);
    }

    pub fn set_all(&mut self, option: CoapOption, values: Vec<Vec<u8>>) {
        if values.is_empty() {
            self.remove(option);
        } else {
            self.options.insert(option.number(), values);
        }
    }

    pub fn remove(&mut self, option: CoapOption) -> Option<Vec<Vec<u8>>> {
        self.options.remove(&option.number())
    }

    pub fn get(&self, option: CoapOption) -> Option<&[Vec<u8>]> {
        self.options.get(&option.number()).map(Vec::as_slice)
    }

    pub fn get_first(&self, option: CoapOption) -> Option<&[u8]> {
        self.get(option)
            .and_then(|values| values.first())
            .map(Vec::as_slice)
    }

    pub fn get_uint(&self, option: CoapOption) -> Option<u32> {
        self.get_first(option).and_then(decode_uint)
    }

    pub fn contains(&self, option: CoapOption) -> bool {
        self.options.contains_key(&option.number())
    }

    /// Number of option instances, counting each repeated value.
    pub fn len(&self) -> usize {
        self.options.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Iterates over `(number, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        self.options
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v.as_slice())))
    }

    /// Inserts a decoded value, rejecting repeats of non-repeatable options.
    pub(crate) fn push_decoded(&mut self, number: u16, value: Vec<u8>) -> Result<(), u16> {
        match self.options.entry(number) {
            Entry::Vacant(v) => {
                v.insert(vec![value]);
            }
            Entry::Occupied(mut o) => {
                if !CoapOption::from(number).is_repeatable() {
                    return Err(number);
                }
                o.get_mut().push(value);
            }
        }
        Ok(())
    }

    /// Checks the per-option bounds before encoding.
    pub fn validate(&self) -> Result<(), EncodingError> {
        for (number, values) in &self.options {
            let Some(definition) = CoapOption::from(*number).definition() else {
                continue;
            };
            if !definition.repeatable && values.len() > 1 {
                return Err(EncodingError::RepeatedOption(*number));
            }
            if let Some(value) = values.iter().find(|v| !definition.length.contains(&v.len())) {
                return Err(EncodingError::InvalidOptionLength {
                    number: *number,
                    length: value.len(),
                });
            }
        }
        Ok(())
    }

    /// Removes elective options the engine cannot interpret and reports the
    /// first critical one.
    ///
    /// An option is unrecognized when its number is unknown or its value
    /// length is outside the registered bounds.
    pub fn strip_unrecognized(&mut self) -> Result<(), UnknownCriticalOption> {
        let unrecognized: Vec<u16> = self
            .options
            .iter()
            .filter(|(number, values)| match CoapOption::from(**number).definition() {
                Some(definition) => values.iter().any(|v| !definition.length.contains(&v.len())),
                None => true,
            })
            .map(|(number, _)| *number)
            .collect();

        if let Some(critical) = unrecognized
            .iter()
            .find(|number| CoapOption::from(**number).is_critical())
        {
            return Err(UnknownCriticalOption(*critical));
        }
        for number in unrecognized {
            self.options.remove(&number);
        }
        Ok(())
    }
}

/// Writes `bytes` as `0x` followed by lowercase hex digits.
pub(crate) fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    f.write_str("0x")?;
    bytes.iter().try_for_each(|b| write!(f, "{:02x}", b))
}

/// Renders options as `Name: value` pairs in wire order, decoding each value
/// by its registered format.
impl fmt::Display for OptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (number, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let Some(definition) = CoapOption::from(number).definition() else {
                write!(f, "Option {}: ", number)?;
                write_hex(f, value)?;
                continue;
            };
            f.write_str(definition.name)?;
            match definition.format {
                OptionFormat::Empty if value.is_empty() => {}
                OptionFormat::Uint if value.len() <= 4 => {
                    write!(f, ": {}", decode_uint(value).unwrap_or_default())?
                }
                OptionFormat::String if std::str::from_utf8(value).is_ok() => {
                    write!(f, ": {:?}", String::from_utf8_lossy(value))?
                }
                _ => {
                    f.write_str(": ")?;
                    write_hex(f, value)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_option_properties() {
        assert!(CoapOption::UriPath.is_critical());
        assert!(CoapOption::UriPath.is_unsafe());
        assert!(!CoapOption::ContentFormat.is_critical());
        assert!(CoapOption::Size1.is_no_cache_key());
        assert!(CoapOption::Block2.is_critical());
        assert!(!CoapOption::Observe.is_critical());
        assert!(CoapOption::Unknown(2049).is_repeatable());
        assert!(!CoapOption::Observe.is_repeatable());
        for number in [1u16, 3, 4, 5, 6, 7, 8, 11, 12, 14, 15, 17, 20, 23, 27, 28, 35, 39, 60, 258] {
            assert_eq!(CoapOption::from(number).number(), number);
            assert!(CoapOption::from(number).definition().is_some());
        }
    }

    #[test]
    fn test_uint_values() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(60), vec![60]);
        assert_eq!(encode_uint(0x1234), vec![0x12, 0x34]);
        assert_eq!(encode_uint(0x0001_0000), vec![0x01, 0x00, 0x00]);
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[0x12, 0x34]), Some(0x1234));
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_table_order_independent_of_insertion() {
        let mut a = OptionTable::new();
        a.add(CoapOption::UriQuery, b"a=1".to_vec());
        a.add(CoapOption::UriPath, b"Hi".to_vec());
        a.add(CoapOption::UriPath, b"Test".to_vec());

        let mut b = OptionTable::new();
        b.add(CoapOption::UriPath, b"Hi".to_vec());
        b.add(CoapOption::UriQuery, b"a=1".to_vec());
        b.add(CoapOption::UriPath, b"Test".to_vec());

        assert_eq!(a, b);
        let numbers: Vec<u16> = a.iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![11, 11, 15]);
        assert_eq!(a.get(CoapOption::UriPath).unwrap()[1], b"Test".to_vec());
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_validate() {
        let mut table = OptionTable::new();
        table.add(CoapOption::ContentFormat, vec![0, 0, 0]);
        assert_eq!(
            table.validate(),
            Err(EncodingError::InvalidOptionLength {
                number: 12,
                length: 3
            })
        );

        let mut table = OptionTable::new();
        table.add(CoapOption::Observe, vec![]);
        table.add(CoapOption::Observe, vec![1]);
        assert_eq!(table.validate(), Err(EncodingError::RepeatedOption(6)));

        let mut table = OptionTable::new();
        table.add(CoapOption::Unknown(65000), vec![0; 300]);
        assert_eq!(table.validate(), Ok(()));
    }

    #[test]
    fn test_strip_unrecognized() {
        let mut table = OptionTable::new();
        table.add(CoapOption::Unknown(2048), vec![1]);
        table.add(CoapOption::ContentFormat, vec![1, 2, 3]);
        table.add(CoapOption::UriPath, b"ok".to_vec());
        assert_eq!(table.strip_unrecognized(), Ok(()));
        assert!(!table.contains(CoapOption::Unknown(2048)));
        assert!(!table.contains(CoapOption::ContentFormat));
        assert!(table.contains(CoapOption::UriPath));

        table.add(CoapOption::Unknown(2049), vec![]);
        assert_eq!(table.strip_unrecognized(), Err(UnknownCriticalOption(2049)));

        let mut table = OptionTable::new();
        table.add(CoapOption::UriHost, vec![]);
        assert_eq!(table.strip_unrecognized(), Err(UnknownCriticalOption(3)));
    }

    #[test]
    fn test_push_decoded_rejects_repeats() {
        let mut table = OptionTable::new();
        assert_eq!(table.push_decoded(11, b"a".to_vec()), Ok(()));
        assert_eq!(table.push_decoded(11, b"b".to_vec()), Ok(()));
        assert_eq!(table.push_decoded(12, vec![]), Ok(()));
        assert_eq!(table.push_decoded(12, vec![]), Err(12));
    }

    #[test]
    fn test_display() {
        let mut table = OptionTable::new();
        table.add(CoapOption::UriPath, b"sensors".to_vec());
        table.add(CoapOption::UriPath, b"temp".to_vec());
        table.add(CoapOption::Observe, encode_uint(0));
        table.add(CoapOption::ETag, vec![0xCA, 0xFE]);
        table.add(CoapOption::IfNoneMatch, vec![]);
        table.add(CoapOption::ContentFormat, encode_uint(50));
        table.add(CoapOption::Unknown(2050), vec![1, 2]);
        assert_eq!(
            table.to_string(),
            "ETag: 0xcafe, If-None-Match, Observe: 0, Uri-Path: \"sensors\", \
             Uri-Path: \"temp\", Content-Format: 50, Option 2050: 0x0102"
        );

        let mut table = OptionTable::new();
        table.add(CoapOption::UriQuery, vec![0xFF]);
        assert_eq!(table.to_string(), "Uri-Query: 0xff");
        assert_eq!(OptionTable::new().to_string(), "");
    }
}
