//! Plain-text extraction with encoding detection.
//!
//! Decoding order: BOM, UTF-8 validity over the first kilobyte, a Cyrillic
//! byte-frequency test for CP-1251, then lossy UTF-8 as the last resort.
//! HTML input is stripped to its text with a minimal entity set; XML and SVG
//! keep CDATA contents.

use std::fs;
use std::io::Read;
use std::path::Path;

use super::{ExtractionResult, TextExtractor};
use crate::error::Result;

const SNIFF_BYTES: usize = 1000;
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

const HANDLED_MIMES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-javascript",
    "application/typescript",
    "application/x-typescript",
    "application/yaml",
    "application/x-yaml",
    "application/x-sh",
    "application/x-shellscript",
    "application/toml",
    "image/svg+xml",
];

pub struct PlainTextExtractor {
    max_bytes: u64,
}

impl PlainTextExtractor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl Default for PlainTextExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

impl TextExtractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_handle(&self, mime: &str) -> bool {
        mime.starts_with("text/") || HANDLED_MIMES.contains(&mime)
    }

    fn extract(&self, path: &Path) -> Result<Option<ExtractionResult>> {
        let file = fs::File::open(path)?;
        let mut raw = Vec::new();
        file.take(self.max_bytes).read_to_end(&mut raw)?;
        if raw.is_empty() {
            return Ok(None);
        }

        let (decoded, encoding) = decode(&raw);

        let markup = markup_kind(path);
        let text = match markup {
            Markup::Html => strip_markup(&decoded, false),
            Markup::Xml => strip_markup(&decoded, true),
            Markup::None => decoded,
        };

        let text = collapse_whitespace(&text);
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(ExtractionResult {
            text,
            method: match markup {
                Markup::Html | Markup::Xml => "html".to_string(),
                Markup::None => "plain".to_string(),
            },
            language: match encoding {
                Encoding::Cp1251 => "ru".to_string(),
                _ => String::new(),
            },
            confidence: 1.0,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    Cp1251,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Markup {
    None,
    Html,
    Xml,
}

fn markup_kind(path: &Path) -> Markup {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") | Some("xhtml") => Markup::Html,
        Some("xml") | Some("svg") => Markup::Xml,
        _ => Markup::None,
    }
}

fn decode(raw: &[u8]) -> (String, Encoding) {
    // BOM wins outright.
    if raw.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return (
            String::from_utf8_lossy(&raw[3..]).into_owned(),
            Encoding::Utf8,
        );
    }
    if raw.starts_with(&[0xFF, 0xFE]) {
        return (decode_utf16(&raw[2..], true), Encoding::Utf16Le);
    }
    if raw.starts_with(&[0xFE, 0xFF]) {
        return (decode_utf16(&raw[2..], false), Encoding::Utf16Be);
    }

    let sniff = &raw[..raw.len().min(SNIFF_BYTES)];
    if std::str::from_utf8(sniff).is_ok() {
        return (String::from_utf8_lossy(raw).into_owned(), Encoding::Utf8);
    }
    if looks_like_cp1251(sniff) {
        return (decode_cp1251(raw), Encoding::Cp1251);
    }
    (String::from_utf8_lossy(raw).into_owned(), Encoding::Utf8)
}

fn decode_utf16(raw: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// CP-1251 heuristic: among non-ASCII bytes, the Cyrillic letter range
/// (0xC0..=0xFF plus Ё/ё at 0xA8/0xB8) must dominate.
fn looks_like_cp1251(sniff: &[u8]) -> bool {
    let mut high = 0usize;
    let mut cyrillic = 0usize;
    for &b in sniff {
        if b >= 0x80 {
            high += 1;
            if (0xC0..=0xFF).contains(&b) || b == 0xA8 || b == 0xB8 {
                cyrillic += 1;
            }
        }
    }
    high > 0 && cyrillic * 2 > high
}

/// Upper half of the CP-1251 code page (0x80..=0xFF).
const CP1251_HIGH: [char; 128] = [
    '\u{0402}', '\u{0403}', '\u{201A}', '\u{0453}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{20AC}', '\u{2030}', '\u{0409}', '\u{2039}', '\u{040A}', '\u{040C}', '\u{040B}', '\u{040F}',
    '\u{0452}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{FFFD}', '\u{2122}', '\u{0459}', '\u{203A}', '\u{045A}', '\u{045C}', '\u{045B}', '\u{045F}',
    '\u{00A0}', '\u{040E}', '\u{045E}', '\u{0408}', '\u{00A4}', '\u{0490}', '\u{00A6}', '\u{00A7}',
    '\u{0401}', '\u{00A9}', '\u{0404}', '\u{00AB}', '\u{00AC}', '\u{00AD}', '\u{00AE}', '\u{0407}',
    '\u{00B0}', '\u{00B1}', '\u{0406}', '\u{0456}', '\u{0491}', '\u{00B5}', '\u{00B6}', '\u{00B7}',
    '\u{0451}', '\u{2116}', '\u{0454}', '\u{00BB}', '\u{0458}', '\u{0405}', '\u{0455}', '\u{0457}',
    '\u{0410}', '\u{0411}', '\u{0412}', '\u{0413}', '\u{0414}', '\u{0415}', '\u{0416}', '\u{0417}',
    '\u{0418}', '\u{0419}', '\u{041A}', '\u{041B}', '\u{041C}', '\u{041D}', '\u{041E}', '\u{041F}',
    '\u{0420}', '\u{0421}', '\u{0422}', '\u{0423}', '\u{0424}', '\u{0425}', '\u{0426}', '\u{0427}',
    '\u{0428}', '\u{0429}', '\u{042A}', '\u{042B}', '\u{042C}', '\u{042D}', '\u{042E}', '\u{042F}',
    '\u{0430}', '\u{0431}', '\u{0432}', '\u{0433}', '\u{0434}', '\u{0435}', '\u{0436}', '\u{0437}',
    '\u{0438}', '\u{0439}', '\u{043A}', '\u{043B}', '\u{043C}', '\u{043D}', '\u{043E}', '\u{043F}',
    '\u{0440}', '\u{0441}', '\u{0442}', '\u{0443}', '\u{0444}', '\u{0445}', '\u{0446}', '\u{0447}',
    '\u{0448}', '\u{0449}', '\u{044A}', '\u{044B}', '\u{044C}', '\u{044D}', '\u{044E}', '\u{044F}',
];

fn decode_cp1251(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                CP1251_HIGH[(b - 0x80) as usize]
            }
        })
        .collect()
}

/// Strip markup tags, decoding the minimal entity set. With `keep_cdata`,
/// `<![CDATA[...]]>` sections contribute their raw contents.
fn strip_markup(input: &str, keep_cdata: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < input.len() {
        if keep_cdata && input[i..].starts_with("<![CDATA[") {
            let start = i + "<![CDATA[".len();
            match input[start..].find("]]>") {
                Some(end) => {
                    out.push_str(&input[start..start + end]);
                    i = start + end + 3;
                }
                None => {
                    out.push_str(&input[start..]);
                    i = input.len();
                }
            }
            continue;
        }
        match bytes[i] {
            b'<' => {
                // Skip to the closing bracket; an unterminated tag swallows
                // the rest of the input.
                match input[i..].find('>') {
                    Some(end) => {
                        out.push(' ');
                        i += end + 1;
                    }
                    None => i = input.len(),
                }
            }
            b'&' => {
                let (replacement, consumed) = decode_entity(&input[i..]);
                out.push_str(replacement);
                i += consumed;
            }
            _ => {
                let ch_len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&input[i..i + ch_len]);
                i += ch_len;
            }
        }
    }
    out
}

fn decode_entity(input: &str) -> (&str, usize) {
    const ENTITIES: &[(&str, &str)] = &[
        ("&nbsp;", " "),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&amp;", "&"),
        ("&quot;", "\""),
        ("&apos;", "'"),
    ];
    for (entity, replacement) in ENTITIES {
        if input.starts_with(entity) {
            return (replacement, entity.len());
        }
    }
    ("&", 1)
}

/// Collapse whitespace runs to single spaces and trim the ends.
pub(super) fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_space = true;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
