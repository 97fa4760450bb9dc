// MIDI input and output at the edges of the pipeline.
//
// Input: a Standard MIDI File becomes one flat token stream. Tracks of a
// format 0/1 file are merged on absolute tick (the model has no notion of
// parts or instruments). Format 2 tracks are independent patterns with their
// own clocks, so each is tokenized alone and the results are joined in track
// order. Percussion on channel 10 is ignored, and note-ons (velocity > 0)
// that start on the same tick are grouped into one simultaneity: a single
// pitch is a note token, several pitches a chord token (see token.rs).
// Durations, rests and velocities are not represented.
//
// Output: a token sequence becomes a single-track SMF for piano, one quarter
// note per token at velocity 100. Chord members are sounded together. A
// member that cannot be turned into a MIDI number is skipped with a warning;
// a token with no playable member is dropped without advancing time.
//
// Uses the `midly` crate for both directions.

use crate::error::Result;
use crate::token::Token;
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::path::Path;
use tracing::warn;

/// Ticks per quarter note in MIDI output.
const TICKS_PER_QUARTER: u16 = 480;

/// Zero-based MIDI channel reserved for percussion.
const DRUM_CHANNEL: u8 = 9;

/// Default output tempo.
pub const DEFAULT_TEMPO_BPM: u16 = 120;

/// Slowest tempo whose microseconds-per-quarter fits the 24-bit tempo event.
pub const MIN_TEMPO_BPM: u16 = 4;

const MICROS_PER_MINUTE: u32 = 60_000_000;

const VELOCITY: u8 = 100;

/// Acoustic Grand Piano.
const PIANO_PROGRAM: u8 = 0;

/// Tokens for every onset in an in-memory SMF, in time order.
pub fn extract_tokens(bytes: &[u8]) -> Result<Vec<Token>> {
    let smf = Smf::parse(bytes)?;
    if matches!(smf.header.format, Format::Sequential) {
        return Ok(smf
            .tracks
            .iter()
            .flat_map(|track| {
                let mut onsets = Vec::new();
                push_onsets(track, &mut onsets);
                group_onsets(onsets)
            })
            .collect());
    }

    let mut onsets = Vec::new();
    for track in &smf.tracks {
        push_onsets(track, &mut onsets);
    }
    Ok(group_onsets(onsets))
}

/// Appends `(absolute tick, key)` for every sounding non-drum note-on.
fn push_onsets(track: &Track<'_>, onsets: &mut Vec<(u64, u8)>) {
    let mut tick: u64 = 0;
    for event in track {
        tick += event.delta.as_int() as u64;
        if let TrackEventKind::Midi {
            channel,
            message: MidiMessage::NoteOn { key, vel },
        } = event.kind
        {
            if vel.as_int() > 0 && channel.as_int() != DRUM_CHANNEL {
                onsets.push((tick, key.as_int()));
            }
        }
    }
}

/// One token per distinct onset tick.
fn group_onsets(mut onsets: Vec<(u64, u8)>) -> Vec<Token> {
    onsets.sort_unstable();
    onsets.dedup();

    let mut tokens = Vec::new();
    let mut start = 0;
    while start < onsets.len() {
        let tick = onsets[start].0;
        let end = onsets[start..]
            .iter()
            .position(|&(t, _)| t != tick)
            .map_or(onsets.len(), |n| start + n);
        let pitches: Vec<u8> = onsets[start..end].iter().map(|&(_, k)| k).collect();
        tokens.extend(Token::from_simultaneity(&pitches));
        start = end;
    }
    tokens
}

/// Read a MIDI file and extract its tokens.
pub fn read_midi_tokens(path: &Path) -> Result<Vec<Token>> {
    let bytes = std::fs::read(path)?;
    extract_tokens(&bytes)
}

/// Render tokens to MIDI and write them to `path`.
pub fn write_tokens(tokens: &[Token], path: &Path, tempo_bpm: u16) -> Result<()> {
    let smf = tokens_to_smf(tokens, tempo_bpm);
    let mut buf = Vec::new();
    smf.write_std(&mut buf)?;
    std::fs::write(path, &buf)?;
    Ok(())
}

/// Build a single-track SMF, one quarter note per token.
///
/// Tempos below `MIN_TEMPO_BPM` are raised to it.
pub fn tokens_to_smf(tokens: &[Token], tempo_bpm: u16) -> Smf<'static> {
    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));
    let channel = u4::new(0);
    let mut track: Track<'static> = Vec::new();

    if tempo_bpm < MIN_TEMPO_BPM {
        warn!(tempo_bpm, min = MIN_TEMPO_BPM, "tempo too slow for a MIDI tempo event, clamping");
    }
    let tempo_microseconds = MICROS_PER_MINUTE / tempo_bpm.max(MIN_TEMPO_BPM) as u32;
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo_microseconds))),
    });
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::TrackName(b"Moodweaver")),
    });
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Midi {
            channel,
            message: MidiMessage::ProgramChange {
                program: u7::new(PIANO_PROGRAM),
            },
        },
    });

    for token in tokens {
        let mut pitches: Vec<u8> = Vec::new();
        for member in token.midi_pitches() {
            match member {
                Ok(p) => pitches.push(p),
                Err(e) => warn!(token = %token, error = %e, "skipping unplayable chord member"),
            }
        }
        pitches.sort_unstable();
        pitches.dedup();
        if pitches.is_empty() {
            warn!(token = %token, "skipping token with no playable pitches");
            continue;
        }

        for &pitch in &pitches {
            track.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOn {
                        key: u7::new(pitch),
                        vel: u7::new(VELOCITY),
                    },
                },
            });
        }
        for (i, &pitch) in pitches.iter().enumerate() {
            let delta = if i == 0 { TICKS_PER_QUARTER as u32 } else { 0 };
            track.push(TrackEvent {
                delta: u28::new(delta),
                kind: TrackEventKind::Midi {
                    channel,
                    message: MidiMessage::NoteOff {
                        key: u7::new(pitch),
                        vel: u7::new(0),
                    },
                },
            });
        }
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);
    smf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(names: &[&str]) -> Vec<Token> {
        names.iter().map(|&n| Token::new(n)).collect()
    }

    fn to_bytes(smf: &Smf) -> Vec<u8> {
        let mut buf = Vec::new();
        smf.write_std(&mut buf).unwrap();
        buf
    }

    fn note_on(delta: u32, channel: u8, key: u8, vel: u8) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(channel),
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                },
            },
        }
    }

    #[test]
    fn rendered_tokens_read_back() {
        let original = tokens(&["C4", "0.4.7", "F#3"]);
        let smf = tokens_to_smf(&original, 100);
        assert_eq!(smf.tracks.len(), 1);
        let recovered = extract_tokens(&to_bytes(&smf)).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn unplayable_tokens_are_dropped() {
        let smf = tokens_to_smf(&tokens(&["C4", "???", "D4"]), 120);
        let recovered = extract_tokens(&to_bytes(&smf)).unwrap();
        assert_eq!(recovered, tokens(&["C4", "D4"]));
    }

    #[test]
    fn tracks_merge_and_drums_are_ignored() {
        let mut smf = Smf::new(Header::new(Format::Parallel, Timing::Metrical(u15::new(480))));
        let end = TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        };
        // Track 1: C4 at tick 0, D4 at tick 480.
        smf.tracks.push(vec![note_on(0, 0, 60, 90), note_on(480, 0, 62, 90), end]);
        // Track 2: E4 at tick 0 (joins C4), kick drum at 240, zero-velocity note-off.
        smf.tracks.push(vec![
            note_on(0, 1, 64, 90),
            note_on(240, DRUM_CHANNEL, 36, 90),
            note_on(0, 1, 64, 0),
            end,
        ]);
        let recovered = extract_tokens(&to_bytes(&smf)).unwrap();
        assert_eq!(recovered, tokens(&["0.4", "D4"]));
    }

    #[test]
    fn sequential_tracks_are_joined_in_order() {
        let mut smf = Smf::new(Header::new(Format::Sequential, Timing::Metrical(u15::new(480))));
        let end = TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        };
        // Both patterns start at their own tick 0; merging would make one chord.
        smf.tracks.push(vec![note_on(0, 0, 60, 90), note_on(480, 0, 62, 90), end]);
        smf.tracks.push(vec![note_on(0, 0, 64, 90), note_on(0, 0, 67, 90), end]);
        let recovered = extract_tokens(&to_bytes(&smf)).unwrap();
        assert_eq!(recovered, tokens(&["C4", "D4", "4.7"]));
    }

    fn tempo_of(smf: &Smf) -> Option<u32> {
        smf.tracks[0].iter().find_map(|e| match e.kind {
            TrackEventKind::Meta(MetaMessage::Tempo(t)) => Some(t.as_int()),
            _ => None,
        })
    }

    #[test]
    fn tempo_is_written_exactly() {
        let smf = tokens_to_smf(&tokens(&["C4"]), 120);
        assert_eq!(tempo_of(&smf), Some(500_000));
        let smf = tokens_to_smf(&tokens(&["C4"]), MIN_TEMPO_BPM);
        assert_eq!(tempo_of(&smf), Some(15_000_000));
    }

    #[test]
    fn tempo_below_minimum_is_clamped_not_wrapped() {
        for bpm in [0, 1, 2, 3] {
            let smf = tokens_to_smf(&tokens(&["C4"]), bpm);
            assert_eq!(tempo_of(&smf), Some(MICROS_PER_MINUTE / MIN_TEMPO_BPM as u32));
        }
        assert!(MICROS_PER_MINUTE / (MIN_TEMPO_BPM as u32) <= 0xFF_FFFF);
        assert!(MICROS_PER_MINUTE / (MIN_TEMPO_BPM as u32 - 1) > 0xFF_FFFF);
    }

    #[test]
    fn garbage_is_a_midi_error() {
        assert!(extract_tokens(b"not a midi file").is_err());
    }
}
