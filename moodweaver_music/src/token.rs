// Canonical symbolic tokens.
//
// A token is the model's atomic vocabulary element: either one pitched note
// or one simultaneity (chord). Both are plain strings so that tokens extracted
// from different files compare by exact equality.
//
// Notes use scientific pitch notation with sharps: MIDI 60 is `C4`, MIDI 61
// is `C#4`. Chords are the sorted, de-duplicated pitch classes of their
// members joined with `.`, so `{C4, E4, G4}` and `{G3, C4, E5}` both become
// `0.4.7`. Octave information of chord members is discarded on purpose; the
// renderer (midi.rs) places bare pitch classes into octave 4.
//
// Parsing accepts `b` and `-` as flat signs in addition to `#`, so tokens
// written by other tools (`E-4`, `Bb3`) still map to MIDI numbers. The price
// is that octave -1 names (`C-1`, MIDI 0–11) read back as flats; those pitches
// never survive rarity filtering in practice.

use crate::error::{MusicError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between chord members.
pub const CHORD_SEPARATOR: char = '.';

/// Octave that bare pitch classes are placed into when rendered.
pub const CHORD_RENDER_OCTAVE: i32 = 4;

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap an already-canonical token string.
    pub fn new(raw: impl Into<String>) -> Self {
        Token(raw.into())
    }

    /// Token for a single MIDI note.
    pub fn note(midi: u8) -> Self {
        let octave = midi as i32 / 12 - 1;
        Token(format!("{}{}", SHARP_NAMES[(midi % 12) as usize], octave))
    }

    /// Token for a set of simultaneous MIDI notes.
    ///
    /// One pitch yields a note token. Two or more yield a chord token of
    /// sorted unique pitch classes. Returns `None` for an empty slice.
    pub fn from_simultaneity(pitches: &[u8]) -> Option<Self> {
        match pitches {
            [] => None,
            [single] => Some(Token::note(*single)),
            many => {
                let mut classes: Vec<u8> = many.iter().map(|p| p % 12).collect();
                classes.sort_unstable();
                classes.dedup();
                let joined = classes
                    .iter()
                    .map(|pc| pc.to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                Some(Token(joined))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chord tokens are made of bare pitch-class numbers.
    pub fn is_chord(&self) -> bool {
        self.members().all(|m| m.parse::<u8>().is_ok())
    }

    /// The `.`-separated members of the token (a single member for notes).
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.0.split(CHORD_SEPARATOR)
    }

    /// MIDI numbers for every member, clamped into `0..=127`.
    ///
    /// Members that are neither note names nor pitch classes are reported
    /// individually so the caller can skip them and keep the rest.
    pub fn midi_pitches(&self) -> Vec<Result<u8>> {
        self.members().map(member_to_midi).collect()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(raw: &str) -> Self {
        Token::new(raw)
    }
}

fn member_to_midi(member: &str) -> Result<u8> {
    if let Ok(number) = member.parse::<i32>() {
        // Bare integers are pitch classes from chord tokens.
        let midi = ((CHORD_RENDER_OCTAVE + 1) * 12).saturating_add(number);
        return Ok(midi.clamp(0, 127) as u8);
    }
    parse_note_name(member)
        .map(|midi| midi.clamp(0, 127) as u8)
        .ok_or_else(|| MusicError::MalformedToken(member.to_string()))
}

/// Parse a note name like `C4`, `F#3`, `Bb2` or `E-5` into a MIDI number.
///
/// The result is not clamped; `B#9` parses to 132. Extreme octaves saturate
/// at the `i32` bounds.
pub fn parse_note_name(name: &str) -> Option<i32> {
    let mut chars = name.chars();
    let letter = chars.next()?;
    let base = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    let (accidentals, octave) = rest.split_at(digits_at);
    let mut shift = 0;
    for c in accidentals.chars() {
        match c {
            '#' => shift += 1,
            'b' | '-' => shift -= 1,
            _ => return None,
        }
    }
    let octave: i32 = octave.parse().ok()?;
    Some(
        octave
            .saturating_add(1)
            .saturating_mul(12)
            .saturating_add(base + shift),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_names_follow_scientific_pitch() {
        assert_eq!(Token::note(60).as_str(), "C4");
        assert_eq!(Token::note(61).as_str(), "C#4");
        assert_eq!(Token::note(21).as_str(), "A0");
        assert_eq!(Token::note(0).as_str(), "C-1");
    }

    #[test]
    fn chord_members_are_sorted_unique_pitch_classes() {
        let a = Token::from_simultaneity(&[67, 60, 64]).unwrap();
        let b = Token::from_simultaneity(&[64, 55, 72, 76]).unwrap();
        assert_eq!(a.as_str(), "0.4.7");
        assert_eq!(a, b);
        assert!(a.is_chord());
    }

    #[test]
    fn single_pitch_is_a_note() {
        let t = Token::from_simultaneity(&[62]).unwrap();
        assert_eq!(t.as_str(), "D4");
        assert!(!t.is_chord());
        assert!(Token::from_simultaneity(&[]).is_none());
    }

    #[test]
    fn parse_note_name_handles_accidentals() {
        assert_eq!(parse_note_name("C4"), Some(60));
        assert_eq!(parse_note_name("F#3"), Some(54));
        assert_eq!(parse_note_name("Bb2"), Some(46));
        assert_eq!(parse_note_name("E-4"), Some(63));
        assert_eq!(parse_note_name("H4"), None);
        assert_eq!(parse_note_name("C"), None);
        assert_eq!(parse_note_name("C?4"), None);
    }

    #[test]
    fn midi_pitches_for_chords_land_in_octave_four() {
        let chord = Token::new("0.4.7");
        let pitches: Vec<u8> = chord
            .midi_pitches()
            .into_iter()
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(pitches, vec![60, 64, 67]);
    }

    #[test]
    fn midi_pitches_report_bad_members() {
        let mixed = Token::new("C4.zz");
        let results = mixed.midi_pitches();
        assert_eq!(results.len(), 2);
        assert_eq!(*results[0].as_ref().unwrap(), 60);
        assert!(results[1].is_err());
    }

    #[test]
    fn extreme_numbers_clamp_instead_of_overflowing() {
        let pitches: Vec<u8> = Token::new("2147483647.0")
            .midi_pitches()
            .into_iter()
            .map(|p| p.unwrap())
            .collect();
        assert_eq!(pitches, vec![127, 60]);
        let low = Token::new("-2147483648").midi_pitches();
        assert_eq!(*low[0].as_ref().unwrap(), 0);

        assert_eq!(parse_note_name("C2147483647"), Some(i32::MAX));
        assert_eq!(*Token::new("C2147483647").midi_pitches()[0].as_ref().unwrap(), 127);
    }

    #[test]
    fn tokens_order_lexicographically() {
        let mut tokens = vec![Token::new("D4"), Token::new("0.4.7"), Token::new("C4")];
        tokens.sort();
        let names: Vec<&str> = tokens.iter().map(Token::as_str).collect();
        assert_eq!(names, vec!["0.4.7", "C4", "D4"]);
    }
}
