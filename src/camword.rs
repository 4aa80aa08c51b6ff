//! # Camword Encoding
//!
//! Compact string encoding of which camera/spectrograph combinations
//! participate in a unit of processing. The instrument carries up to 30
//! cameras: three bands (b, r, z) on each of ten spectrographs. A camword
//! groups complete spectrographs under `a` and lists leftover cameras by
//! band, so `a0123456789` is the whole instrument and `a2b3r3` is all of
//! spectrograph 2 plus the b and r cameras of spectrograph 3.
//!
//! Camword arithmetic (union, difference, complement) must be consistent
//! and invertible: pruning cameras out of a processing unit and adding them
//! back must always reconstruct the original word.

use crate::constants::instrument::NUM_SPECTROGRAPHS;
use crate::error::{Result, SpecpipeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Spectrograph arm: blue, red, or near-infrared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Band {
    B,
    R,
    Z,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::B, Band::R, Band::Z];

    pub fn as_char(&self) -> char {
        match self {
            Band::B => 'b',
            Band::R => 'r',
            Band::Z => 'z',
        }
    }

    pub fn from_char(c: char) -> Result<Band> {
        match c.to_ascii_lowercase() {
            'b' => Ok(Band::B),
            'r' => Ok(Band::R),
            'z' => Ok(Band::Z),
            other => Err(SpecpipeError::CamwordError(format!(
                "Invalid band character: {other}"
            ))),
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A single camera: one band of one spectrograph, e.g. `b0` or `z7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Camera {
    pub band: Band,
    pub spectrograph: u8,
}

impl Camera {
    pub fn new(band: Band, spectrograph: u8) -> Result<Camera> {
        if spectrograph >= NUM_SPECTROGRAPHS {
            return Err(SpecpipeError::CamwordError(format!(
                "Spectrograph {spectrograph} out of range"
            )));
        }
        Ok(Camera { band, spectrograph })
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.band.as_char(), self.spectrograph)
    }
}

impl FromStr for Camera {
    type Err = SpecpipeError;

    fn from_str(s: &str) -> Result<Camera> {
        let mut chars = s.trim().chars();
        let band = chars
            .next()
            .ok_or_else(|| SpecpipeError::CamwordError("Empty camera name".into()))
            .and_then(Band::from_char)?;
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or_else(|| SpecpipeError::CamwordError(format!("Invalid camera name: {s}")))?;
        if chars.next().is_some() {
            return Err(SpecpipeError::CamwordError(format!(
                "Invalid camera name: {s}"
            )));
        }
        Camera::new(band, digit as u8)
    }
}

/// An ordered set of cameras with a canonical compact string form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Camword {
    cameras: BTreeSet<Camera>,
}

impl Camword {
    /// Empty camword.
    pub fn empty() -> Camword {
        Camword::default()
    }

    /// Camword covering every camera of every spectrograph.
    pub fn full() -> Camword {
        let mut cameras = BTreeSet::new();
        for band in Band::ALL {
            for sp in 0..NUM_SPECTROGRAPHS {
                cameras.insert(Camera {
                    band,
                    spectrograph: sp,
                });
            }
        }
        Camword { cameras }
    }

    /// Build from an explicit camera list.
    pub fn from_cameras<I: IntoIterator<Item = Camera>>(iter: I) -> Camword {
        Camword {
            cameras: iter.into_iter().collect(),
        }
    }

    /// Sorted list of member cameras.
    pub fn decode(&self) -> Vec<Camera> {
        self.cameras.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn contains(&self, camera: Camera) -> bool {
        self.cameras.contains(&camera)
    }

    /// Spectrograph numbers with at least one member camera, ascending.
    pub fn spectrographs(&self) -> Vec<u8> {
        let set: BTreeSet<u8> = self.cameras.iter().map(|c| c.spectrograph).collect();
        set.into_iter().collect()
    }

    /// Cameras in `self` or `other`.
    pub fn union(&self, other: &Camword) -> Camword {
        Camword {
            cameras: self.cameras.union(&other.cameras).copied().collect(),
        }
    }

    /// Cameras in `self` but not in `other`.
    pub fn difference(&self, other: &Camword) -> Camword {
        Camword {
            cameras: self.cameras.difference(&other.cameras).copied().collect(),
        }
    }

    /// Cameras of the full instrument not in `self`.
    pub fn complement(&self) -> Camword {
        Camword::full().difference(self)
    }
}

impl fmt::Display for Camword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Spectrographs with all three bands collapse under 'a'.
        let mut complete: Vec<u8> = Vec::new();
        for sp in 0..NUM_SPECTROGRAPHS {
            let all = Band::ALL.iter().all(|&band| {
                self.cameras.contains(&Camera {
                    band,
                    spectrograph: sp,
                })
            });
            if all {
                complete.push(sp);
            }
        }
        if !complete.is_empty() {
            write!(f, "a")?;
            for sp in &complete {
                write!(f, "{sp}")?;
            }
        }
        for band in Band::ALL {
            let leftover: Vec<u8> = self
                .cameras
                .iter()
                .filter(|c| c.band == band && !complete.contains(&c.spectrograph))
                .map(|c| c.spectrograph)
                .collect();
            if !leftover.is_empty() {
                write!(f, "{}", band.as_char())?;
                for sp in leftover {
                    write!(f, "{sp}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for Camword {
    type Err = SpecpipeError;

    fn from_str(s: &str) -> Result<Camword> {
        let mut cameras = BTreeSet::new();
        let mut current: Option<char> = None;
        let mut digits_seen = true;
        for c in s.trim().chars() {
            match c.to_ascii_lowercase() {
                letter @ ('a' | 'b' | 'r' | 'z') => {
                    if !digits_seen {
                        return Err(SpecpipeError::CamwordError(format!(
                            "Camword group '{}' has no spectrograph digits in {s}",
                            current.unwrap_or('?')
                        )));
                    }
                    current = Some(letter);
                    digits_seen = false;
                }
                d if d.is_ascii_digit() => {
                    let sp = d.to_digit(10).unwrap() as u8;
                    match current {
                        Some('a') => {
                            for band in Band::ALL {
                                cameras.insert(Camera::new(band, sp)?);
                            }
                        }
                        Some(letter) => {
                            cameras.insert(Camera::new(Band::from_char(letter)?, sp)?);
                        }
                        None => {
                            return Err(SpecpipeError::CamwordError(format!(
                                "Camword {s} starts with a digit"
                            )));
                        }
                    }
                    digits_seen = true;
                }
                other => {
                    return Err(SpecpipeError::CamwordError(format!(
                        "Invalid character '{other}' in camword {s}"
                    )));
                }
            }
        }
        if !digits_seen {
            return Err(SpecpipeError::CamwordError(format!(
                "Trailing camword group without digits in {s}"
            )));
        }
        Ok(Camword { cameras })
    }
}

impl Serialize for Camword {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Camword {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalize a user-supplied camera specification into a camword.
///
/// Accepts either a camword (`a12b3`) or a comma-separated list where each
/// token is a camera (`b0`), a bare spectrograph number (`3`, meaning all
/// three bands), or a multi-band group (`br4`).
pub fn parse_cameras(input: &str) -> Result<Camword> {
    let trimmed = input.trim();
    if !trimmed.contains(',') {
        return trimmed.parse();
    }
    let mut cameras = BTreeSet::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            for c in token.chars() {
                let sp = c.to_digit(10).unwrap() as u8;
                for band in Band::ALL {
                    cameras.insert(Camera::new(band, sp)?);
                }
            }
        } else {
            let bands: Vec<Band> = token
                .chars()
                .take_while(|c| c.is_ascii_alphabetic())
                .map(Band::from_char)
                .collect::<Result<_>>()?;
            let digits: Vec<u8> = token
                .chars()
                .skip_while(|c| c.is_ascii_alphabetic())
                .map(|c| {
                    c.to_digit(10).map(|d| d as u8).ok_or_else(|| {
                        SpecpipeError::CamwordError(format!("Invalid camera token: {token}"))
                    })
                })
                .collect::<Result<_>>()?;
            if bands.is_empty() || digits.is_empty() {
                return Err(SpecpipeError::CamwordError(format!(
                    "Invalid camera token: {token}"
                )));
            }
            for &sp in &digits {
                for &band in &bands {
                    cameras.insert(Camera::new(band, sp)?);
                }
            }
        }
    }
    Ok(Camword { cameras })
}

/// One flagged CCD amplifier: band, spectrograph, and amp letter A-D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadAmp {
    pub band: Band,
    pub spectrograph: u8,
    pub amp: char,
}

impl fmt::Display for BadAmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.band.as_char(), self.spectrograph, self.amp)
    }
}

/// Parse and validate a comma-separated bad-amplifier list of the form
/// `[brz][0-9][ABCD]`, e.g. `b7D,z8A`. Amp letters are normalized to
/// uppercase; anything malformed is a configuration error.
pub fn parse_badamps(input: &str) -> Result<Vec<BadAmp>> {
    let mut amps = Vec::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let chars: Vec<char> = token.chars().collect();
        if chars.len() != 3 {
            return Err(SpecpipeError::ConfigurationError(format!(
                "Bad amplifier entry '{token}' is not of the form [brz][0-9][ABCD]"
            )));
        }
        let band = Band::from_char(chars[0]).map_err(|_| {
            SpecpipeError::ConfigurationError(format!(
                "Bad amplifier entry '{token}' has invalid band '{}'",
                chars[0]
            ))
        })?;
        let spectrograph = chars[1].to_digit(10).ok_or_else(|| {
            SpecpipeError::ConfigurationError(format!(
                "Bad amplifier entry '{token}' has invalid spectrograph '{}'",
                chars[1]
            ))
        })? as u8;
        let amp = chars[2].to_ascii_uppercase();
        if !('A'..='D').contains(&amp) {
            return Err(SpecpipeError::ConfigurationError(format!(
                "Bad amplifier entry '{token}' has invalid amp '{}'",
                chars[2]
            )));
        }
        amps.push(BadAmp {
            band,
            spectrograph,
            amp,
        });
    }
    Ok(amps)
}

/// Re-render a validated bad-amplifier list in normalized form.
pub fn validate_badamps(input: &str) -> Result<String> {
    let amps = parse_badamps(input)?;
    Ok(amps
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cw(s: &str) -> Camword {
        s.parse().unwrap()
    }

    #[test]
    fn test_full_camword_string() {
        assert_eq!(Camword::full().to_string(), "a0123456789");
        assert_eq!(Camword::full().len(), 30);
    }

    #[test]
    fn test_parse_and_format_round_trip() {
        for s in ["a0123456789", "a1", "a2b3r3", "b7r7z567", "a12b3r4z3"] {
            let word = cw(s);
            assert_eq!(cw(&word.to_string()), word, "round trip failed for {s}");
        }
    }

    #[test]
    fn test_canonical_form() {
        // b3,r3,z3 collapses to a3
        assert_eq!(cw("b3r3z3").to_string(), "a3");
        assert_eq!(cw("z3r3b3").to_string(), "a3");
    }

    #[test]
    fn test_difference_and_union() {
        let all = Camword::full();
        let bad = cw("b7");
        let good = all.difference(&bad);
        assert_eq!(good.len(), 29);
        assert!(!good.contains("b7".parse().unwrap()));
        assert_eq!(good.union(&bad), all);
    }

    #[test]
    fn test_complement_involution() {
        for s in ["", "a1", "a2b3r3", "a0123456789"] {
            let word = cw(s);
            assert_eq!(word.complement().complement(), word);
            assert_eq!(word.union(&word.complement()), Camword::full());
        }
    }

    #[test]
    fn test_parse_cameras_variants() {
        assert_eq!(parse_cameras("a1").unwrap(), cw("a1"));
        assert_eq!(parse_cameras("b0,r1,z9").unwrap(), cw("b0r1z9"));
        assert_eq!(parse_cameras("0,1,3").unwrap(), cw("a013"));
        assert_eq!(parse_cameras("br4").unwrap(), cw("b4r4"));
        assert!(parse_cameras("q7").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("a".parse::<Camword>().is_err());
        assert!("3b".parse::<Camword>().is_err());
        assert!("a1x2".parse::<Camword>().is_err());
    }

    #[test]
    fn test_parse_badamps() {
        let amps = parse_badamps("b7D,z8a").unwrap();
        assert_eq!(amps.len(), 2);
        assert_eq!(amps[0].band, Band::B);
        assert_eq!(amps[0].spectrograph, 7);
        assert_eq!(amps[0].amp, 'D');
        assert_eq!(amps[1].amp, 'A');
        assert_eq!(validate_badamps("b7D,z8a").unwrap(), "b7D,z8A");
        assert!(parse_badamps("b7E").is_err());
        assert!(parse_badamps("q7A").is_err());
        assert!(parse_badamps("b77A").is_err());
    }
}
