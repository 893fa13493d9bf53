//! Content-encoding negotiation and the gzip/deflate codecs behind it.

use std::io::Read;

/// Response body encodings the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    fn bit(self) -> u32 {
        match self {
            Encoding::Identity => 1 << 0,
            Encoding::Gzip => 1 << 1,
            Encoding::Deflate => 1 << 2,
        }
    }

    fn from_bit(bit: u32) -> Option<Encoding> {
        match bit {
            1 => Some(Encoding::Identity),
            2 => Some(Encoding::Gzip),
            4 => Some(Encoding::Deflate),
            _ => None,
        }
    }

    /// Value for the Content-Encoding header, `None` for identity.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Deflate => Some("deflate"),
        }
    }
}

const ALL_ENCODINGS: u32 = 0b111;

fn parse_quality(attrs: &str) -> f32 {
    for attr in attrs.split(';') {
        let attr = attr.trim();
        if let Some(q) = attr.strip_prefix("q=") {
            return q.trim().parse().unwrap_or(1.0);
        }
    }
    1.0
}

/// Parses a quality-weighted Accept-Encoding value into a bitmask of
/// acceptable encodings.
///
/// A missing header means everything is acceptable. When the header is
/// present, only the listed encodings (and, through `*`, the unlisted ones)
/// count; a quality of 0 excludes an encoding.
pub fn parse_acceptable_encodings(header: Option<&str>) -> u32 {
    let Some(header) = header else {
        return ALL_ENCODINGS;
    };

    let mut acceptable = 0u32;
    let mut named = 0u32;
    let mut star = None;

    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (name, attrs) = match part.split_once(';') {
            Some((name, attrs)) => (name.trim(), attrs),
            None => (part, ""),
        };
        let quality = parse_quality(attrs);

        let encoding = match name {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "identity" => Some(Encoding::Identity),
            "*" => {
                star = Some(quality);
                None
            }
            _ => None,
        };

        if let Some(encoding) = encoding {
            named |= encoding.bit();
            if quality > 0.0 {
                acceptable |= encoding.bit();
            }
        }
    }

    if let Some(quality) = star {
        if quality > 0.0 {
            acceptable |= ALL_ENCODINGS & !named;
        }
    }

    acceptable
}

/// Picks the first preferred encoding the client accepts; falls back to any
/// acceptable encoding; `None` when nothing is acceptable (406 territory).
pub fn negotiate(acceptable: u32, preferred: &[Encoding]) -> Option<Encoding> {
    for &encoding in preferred {
        if acceptable & encoding.bit() != 0 {
            return Some(encoding);
        }
    }
    if acceptable != 0 {
        return Encoding::from_bit(1 << acceptable.trailing_zeros());
    }
    None
}

/// Decompresses a fixed-encoding payload, used when a response attached in one
/// encoding has to be re-encoded for the client.
pub fn decompress(data: &[u8], encoding: Encoding) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        Encoding::Identity => out.extend_from_slice(data),
        Encoding::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Encoding::Deflate => {
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_accepts_everything() {
        assert_eq!(parse_acceptable_encodings(None), ALL_ENCODINGS);
    }

    #[test]
    fn quality_zero_excludes() {
        let mask = parse_acceptable_encodings(Some("gzip;q=0, deflate"));
        assert_eq!(mask, Encoding::Deflate.bit());
    }

    #[test]
    fn star_covers_unlisted() {
        let mask = parse_acceptable_encodings(Some("gzip;q=0, *"));
        assert_eq!(mask, Encoding::Identity.bit() | Encoding::Deflate.bit());
    }
}
