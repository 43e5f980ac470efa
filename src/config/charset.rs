// Frame charset
// Text conversion for frames; unrepresentable characters become '?'

use serde::{Deserialize, Serialize};

const REPLACEMENT: u8 = b'?';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    /// 7-bit ASCII
    #[default]
    Ascii,
    Utf8,
    /// ISO-8859-1, one byte per code point
    Latin1,
}

impl Charset {
    /// Decode received bytes into text
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { REPLACEMENT as char })
                .collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encode text for the wire
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { REPLACEMENT })
                .collect(),
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(REPLACEMENT))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_replaces_high_bytes() {
        assert_eq!(Charset::Ascii.decode(b"PI\xc3NG"), "PI?NG");
        assert_eq!(Charset::Ascii.encode("caf\u{e9}"), b"caf?".to_vec());
    }

    #[test]
    fn test_latin1_keeps_single_byte_code_points() {
        assert_eq!(Charset::Latin1.decode(&[0x63, 0xe9]), "c\u{e9}");
        assert_eq!(Charset::Latin1.encode("c\u{e9}\u{20ac}"), vec![0x63, 0xe9, b'?']);
    }

    #[test]
    fn test_utf8_encoded_length() {
        assert_eq!(Charset::Utf8.encode("\u{e9}").len(), 2);
        assert_eq!(Charset::Utf8.decode("\u{e9}t\u{e9}".as_bytes()), "\u{e9}t\u{e9}");
    }
}
