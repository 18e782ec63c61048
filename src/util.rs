use serde::{de, Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

// Helpers for serde to parse fields with quirks.

/// parse a '1' to `true` and a '0' to `false`
pub fn bool_01<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let s: u8 = Deserialize::deserialize(d)?;
    match s {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(de::Error::custom("expected '0' or '1'")),
    }
}

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<crate::ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    if s.eq_ignore_ascii_case("null") || s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(s.into()))
    }
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

/// Round to 2 decimal places, the precision we report percentages at.
pub fn round2(v: f64) -> f64 {
    (v * 100.).round() / 100.
}
