//! Pixel formats and format negotiation
//!
//! A [`PixelFormat`] is a fourcc memory layout plus the set of modifiers
//! (tiling/compression layouts) that go with it. The compositor, the renderer
//! and every output each advertise such a list; [`intersect`] picks a format
//! all of them can handle.

use std::fmt;
use std::str::FromStr;

/// Four-character code identifying a raw pixel layout (DRM fourcc values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const INVALID: Fourcc = Fourcc(0);
    /// 32bit, alpha
    pub const ARGB8888: Fourcc = Fourcc::from_code(*b"AR24");
    /// 32bit, no alpha
    pub const XRGB8888: Fourcc = Fourcc::from_code(*b"XR24");
    /// 16bit, no alpha
    pub const RGB565: Fourcc = Fourcc::from_code(*b"RG16");

    pub const fn from_code(code: [u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(code))
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::RGB565 => 2,
            _ => 4,
        }
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "INVALID");
        }
        let code = self.0.to_le_bytes();
        if code.iter().all(|c| c.is_ascii_graphic()) {
            write!(f, "{}", String::from_utf8_lossy(&code))
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

/// Error for fourcc strings that are neither a code nor a hex value
#[derive(Debug, thiserror::Error)]
#[error("invalid fourcc {0:?}")]
pub struct ParseFourccError(String);

impl FromStr for Fourcc {
    type Err = ParseFourccError;

    /// Accepts "auto" (no preference), a four character code such as "AR24",
    /// or a hexadecimal value such as "0x34325241".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") || s.is_empty() {
            return Ok(Fourcc::INVALID);
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16)
                .map(Fourcc)
                .map_err(|_| ParseFourccError(s.to_string()));
        }
        match <[u8; 4]>::try_from(s.as_bytes()) {
            Ok(code) => Ok(Fourcc::from_code(code)),
            Err(_) => Err(ParseFourccError(s.to_string())),
        }
    }
}

/// Linear layout, understood by every consumer
pub const MODIFIER_LINEAR: u64 = 0;
/// Implicit/driver-chosen layout
pub const MODIFIER_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Memory layout: a fourcc plus the modifiers compatible with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    fourcc: Fourcc,
    modifiers: Vec<u64>,
}

impl PixelFormat {
    /// Build a format; duplicate modifiers are dropped, first occurrence wins.
    pub fn new(fourcc: Fourcc, modifiers: impl IntoIterator<Item = u64>) -> Self {
        let mut unique: Vec<u64> = Vec::new();
        for modifier in modifiers {
            if !unique.contains(&modifier) {
                unique.push(modifier);
            }
        }
        Self {
            fourcc,
            modifiers: unique,
        }
    }

    /// The "no common format" sentinel
    pub fn invalid() -> Self {
        Self {
            fourcc: Fourcc::INVALID,
            modifiers: Vec::new(),
        }
    }

    pub fn fourcc(&self) -> Fourcc {
        self.fourcc
    }

    /// Modifiers in advisory preference order
    pub fn modifiers(&self) -> &[u64] {
        &self.modifiers
    }

    pub fn is_valid(&self) -> bool {
        self.fourcc.is_valid()
    }

    /// Same fourcc and at least one shared modifier
    pub fn is_compatible(&self, other: &PixelFormat) -> bool {
        self.fourcc == other.fourcc && self.modifiers.iter().any(|m| other.modifiers.contains(m))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.fourcc)?;
        for (i, modifier) in self.modifiers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match *modifier {
                MODIFIER_LINEAR => write!(f, "LINEAR")?,
                MODIFIER_INVALID => write!(f, "INVALID")?,
                other => write!(f, "0x{:016x}", other)?,
            }
        }
        write!(f, "]")
    }
}

/// Fallback candidates, sorted from high to low quality
const PREFERENCE_TABLE: [Fourcc; 3] = [Fourcc::ARGB8888, Fourcc::XRGB8888, Fourcc::RGB565];

/// Pick a format every capability list supports.
///
/// With a concrete `requested` fourcc only that type is tried, otherwise the
/// preference table is walked (high to low quality, or reversed when
/// `prefer_high_quality` is false). The returned modifiers are the ones shared
/// by every list, further narrowed to `requested`'s modifiers when it names
/// any. Returns [`PixelFormat::invalid`] when nothing fits.
pub fn intersect(
    requested: &PixelFormat,
    capability_lists: &[&[PixelFormat]],
    prefer_high_quality: bool,
) -> PixelFormat {
    if capability_lists.is_empty() {
        return PixelFormat::invalid();
    }

    let candidates: Vec<Fourcc> = if requested.is_valid() {
        vec![requested.fourcc()]
    } else if prefer_high_quality {
        PREFERENCE_TABLE.to_vec()
    } else {
        PREFERENCE_TABLE.iter().rev().copied().collect()
    };

    for candidate in candidates {
        let mut matches = Vec::with_capacity(capability_lists.len());
        for list in capability_lists {
            match list.iter().find(|format| format.fourcc() == candidate) {
                Some(format) => matches.push(format),
                None => break,
            }
        }
        if matches.len() != capability_lists.len() {
            continue;
        }

        let mut common: Vec<u64> = if requested.is_valid() && !requested.modifiers().is_empty() {
            requested.modifiers().to_vec()
        } else {
            matches[0].modifiers().to_vec()
        };
        for format in &matches {
            common.retain(|modifier| format.modifiers().contains(modifier));
            if common.is_empty() {
                break;
            }
        }

        if !common.is_empty() {
            return PixelFormat::new(candidate, common);
        }
    }

    PixelFormat::invalid()
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u64 = 0x0100_0000_0000_0001;
    const B: u64 = 0x0100_0000_0000_0002;
    const C: u64 = 0x0100_0000_0000_0003;
    const D: u64 = 0x0100_0000_0000_0004;

    #[test]
    fn test_explicit_type_intersects_modifiers() {
        let requested = PixelFormat::new(Fourcc::ARGB8888, [A, B, C]);
        let first = [PixelFormat::new(Fourcc::ARGB8888, [B, C])];
        let second = [PixelFormat::new(Fourcc::ARGB8888, [C, D])];

        let selected = intersect(&requested, &[&first, &second], true);
        assert_eq!(selected, PixelFormat::new(Fourcc::ARGB8888, [C]));
    }

    #[test]
    fn test_no_common_type_yields_invalid() {
        let requested = PixelFormat::invalid();
        let first = [PixelFormat::new(Fourcc::RGB565, [0])];
        let second = [PixelFormat::new(Fourcc::ARGB8888, [0])];

        let selected = intersect(&requested, &[&first, &second], true);
        assert!(!selected.is_valid());
        assert!(selected.modifiers().is_empty());
    }

    #[test]
    fn test_quality_preference_order() {
        let list = [
            PixelFormat::new(Fourcc::RGB565, [MODIFIER_LINEAR]),
            PixelFormat::new(Fourcc::XRGB8888, [MODIFIER_LINEAR]),
            PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]),
        ];

        let high = intersect(&PixelFormat::invalid(), &[&list, &list], true);
        assert_eq!(high.fourcc(), Fourcc::ARGB8888);

        let low = intersect(&PixelFormat::invalid(), &[&list, &list], false);
        assert_eq!(low.fourcc(), Fourcc::RGB565);
    }

    #[test]
    fn test_disjoint_modifiers_fall_through_to_next_candidate() {
        let first = [
            PixelFormat::new(Fourcc::ARGB8888, [A]),
            PixelFormat::new(Fourcc::XRGB8888, [A, B]),
        ];
        let second = [
            PixelFormat::new(Fourcc::ARGB8888, [B]),
            PixelFormat::new(Fourcc::XRGB8888, [B]),
        ];

        let selected = intersect(&PixelFormat::invalid(), &[&first, &second], true);
        assert_eq!(selected, PixelFormat::new(Fourcc::XRGB8888, [B]));
    }

    #[test]
    fn test_explicit_type_missing_is_invalid() {
        let requested = PixelFormat::new(Fourcc::RGB565, []);
        let list = [PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR])];

        assert!(!intersect(&requested, &[&list], true).is_valid());
    }

    #[test]
    fn test_empty_capability_lists() {
        let requested = PixelFormat::new(Fourcc::ARGB8888, [MODIFIER_LINEAR]);
        assert_eq!(intersect(&requested, &[], true), PixelFormat::invalid());
    }

    #[test]
    fn test_deterministic() {
        let first = [PixelFormat::new(Fourcc::ARGB8888, [D, C, B, A])];
        let second = [PixelFormat::new(Fourcc::ARGB8888, [A, B, C, D])];

        let one = intersect(&PixelFormat::invalid(), &[&first, &second], true);
        let two = intersect(&PixelFormat::invalid(), &[&first, &second], true);
        assert_eq!(one, two);
        assert_eq!(one.modifiers(), &[D, C, B, A]);
    }

    #[test]
    fn test_compatibility() {
        let a = PixelFormat::new(Fourcc::ARGB8888, [A, B]);
        let b = PixelFormat::new(Fourcc::ARGB8888, [B, C]);
        let c = PixelFormat::new(Fourcc::XRGB8888, [B]);

        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        assert!(!a.is_compatible(&PixelFormat::new(Fourcc::ARGB8888, [D])));
    }

    #[test]
    fn test_fourcc_parsing_and_display() {
        assert_eq!("AR24".parse::<Fourcc>().unwrap(), Fourcc::ARGB8888);
        assert_eq!("auto".parse::<Fourcc>().unwrap(), Fourcc::INVALID);
        assert_eq!("0x34325258".parse::<Fourcc>().unwrap(), Fourcc::XRGB8888);
        assert!("ARGB8888".parse::<Fourcc>().is_err());
        assert_eq!(Fourcc::RGB565.to_string(), "RG16");
    }
}
