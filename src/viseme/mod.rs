//! Viseme mapping for lip-sync animation.
//!
//! A viseme is a visual mouth shape that corresponds to a class of
//! phonemes. Producers that know their phoneme timing attach it to each
//! fragment; the coordinator then looks up the viseme under the playhead
//! instead of guessing the mouth shape from loudness.

use crate::audio::fragment::PhonemeTiming;
use std::time::Duration;

/// Oculus viseme IDs (standard for lip-sync)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Viseme {
    /// Silence (default mouth closed)
    Sil = 0,
    /// /p/, /b/, /m/ (lips pressed together)
    PP = 1,
    /// /f/, /v/ (teeth on lip)
    FF = 2,
    /// /θ/, /ð/ (tongue between teeth)
    TH = 3,
    /// /t/, /d/, /n/, /l/ (tongue at roof)
    DD = 4,
    /// /k/, /g/, /ŋ/ (back of tongue up)
    KK = 5,
    /// /tʃ/, /dʒ/, /ʃ/, /ʒ/ (tongue curved)
    CH = 6,
    /// /s/, /z/ (teeth together, tongue forward)
    SS = 7,
    /// /n/, /nj/ (tongue at roof)
    NN = 8,
    /// /r/ (tongue curled)
    RR = 9,
    /// /a/ (mouth open wide)
    AA = 10,
    /// /e/ (mouth medium)
    E = 11,
    /// /i/ (mouth wide, teeth apart)
    I = 12,
    /// /o/ (rounded, medium)
    O = 13,
    /// /u/ (rounded, small)
    U = 14,
}

impl Viseme {
    /// Mouth shape as `(openness, form)`.
    ///
    /// Openness is in `[0, 1]`. Form is in `[-1, 1]`: negative is rounded
    /// or puckered, positive is spread into a smile.
    pub fn mouth_shape(self) -> (f32, f32) {
        match self {
            Viseme::Sil => (0.0, 0.0),
            Viseme::PP => (0.05, 0.0),
            Viseme::FF => (0.15, 0.1),
            Viseme::TH => (0.2, 0.1),
            Viseme::DD => (0.3, 0.2),
            Viseme::KK => (0.45, 0.0),
            Viseme::CH => (0.35, -0.3),
            Viseme::SS => (0.15, 0.5),
            Viseme::NN => (0.25, 0.2),
            Viseme::RR => (0.35, -0.4),
            Viseme::AA => (1.0, 0.1),
            Viseme::E => (0.6, 0.5),
            Viseme::I => (0.4, 0.9),
            Viseme::O => (0.7, -0.7),
            Viseme::U => (0.35, -0.9),
        }
    }

    pub fn is_vowel(self) -> bool {
        matches!(
            self,
            Viseme::AA | Viseme::E | Viseme::I | Viseme::O | Viseme::U
        )
    }
}

/// ARPABET phoneme to viseme mapping.
/// Based on Carnegie Mellon University Pronouncing Dictionary.
pub fn phoneme_to_viseme(phoneme: &str) -> Viseme {
    // Remove stress markers (0, 1, 2)
    let p = phoneme.trim_end_matches(['0', '1', '2']);

    match p.to_ascii_uppercase().as_str() {
        "" | "SIL" | "SP" | "PAU" => Viseme::Sil,

        // Bilabial: lips together
        "B" | "P" | "M" | "EM" | "MX" => Viseme::PP,

        // Labiodental: teeth on lip
        "F" | "V" => Viseme::FF,

        // Dental: tongue between teeth
        "TH" | "DH" => Viseme::TH,

        // Alveolar: tongue at roof
        "T" | "D" | "L" | "DX" | "EL" => Viseme::DD,

        "N" | "NX" | "EN" => Viseme::NN,

        // Velar: back of tongue
        "K" | "G" | "NG" => Viseme::KK,

        // Postalveolar: curled
        "CH" | "JH" | "SH" | "ZH" => Viseme::CH,

        "R" | "RR" => Viseme::RR,

        // Alveolar sibilants
        "S" | "Z" => Viseme::SS,

        "AA" | "AO" | "AW" => Viseme::AA,
        "AE" | "AH" | "EH" | "ER" => Viseme::E,
        "AY" | "EY" | "IH" | "IY" | "Y" => Viseme::I,
        "OW" | "OY" | "UH" => Viseme::O,
        "UW" | "W" => Viseme::U,

        // Default to slight open for unknown
        _ => Viseme::DD,
    }
}

/// Viseme active at `offset` into a fragment, if any timing covers it.
pub fn viseme_at(timings: &[PhonemeTiming], offset: Duration) -> Option<Viseme> {
    timings
        .iter()
        .find(|t| t.covers(offset))
        .map(|t| phoneme_to_viseme(&t.phoneme))
}

/// Base duration per phoneme at speed 1.0.
const BASE_PHONEME_MS: f32 = 80.0;

/// Estimate back-to-back timings for a space-separated ARPABET string.
///
/// For producers that emit phonemes but no alignment. Vowels get 1.5× the
/// base duration, plosives and fricatives 0.8×; silence markers keep their
/// slot so pauses stay closed-mouthed.
pub fn estimate_timings(phonemes: &str, speed: f32) -> Vec<PhonemeTiming> {
    let speed = if speed.is_finite() { speed.max(0.5) } else { 1.0 };
    let base = BASE_PHONEME_MS / speed;

    let mut start_ms = 0.0_f32;
    let mut timings = Vec::new();
    for phone in phonemes.split_whitespace() {
        let bare = phone.trim_end_matches(['0', '1', '2']).to_ascii_uppercase();
        let ms = match bare.as_str() {
            "AA" | "AE" | "AH" | "AO" | "AW" | "AY" | "EH" | "EY" | "IH" | "IY" | "OW" | "OY"
            | "UH" | "UW" | "ER" => base * 1.5,
            "P" | "B" | "T" | "D" | "K" | "G" | "M" | "N" | "F" | "V" | "S" | "Z" => base * 0.8,
            _ => base,
        };
        timings.push(PhonemeTiming::new(
            phone,
            Duration::from_secs_f32(start_ms / 1000.0),
            Duration::from_secs_f32(ms / 1000.0),
        ));
        start_ms += ms;
    }
    timings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilabials_map_to_pp() {
        for p in ["B", "P", "M"] {
            assert_eq!(phoneme_to_viseme(p), Viseme::PP);
        }
    }

    #[test]
    fn stress_markers_and_case_are_ignored() {
        assert_eq!(phoneme_to_viseme("AA1"), Viseme::AA);
        assert_eq!(phoneme_to_viseme("uw0"), Viseme::U);
        assert_eq!(phoneme_to_viseme("sil"), Viseme::Sil);
    }

    #[test]
    fn unknown_phonemes_are_slightly_open() {
        assert_eq!(phoneme_to_viseme("QQ"), Viseme::DD);
    }

    #[test]
    fn shapes_stay_in_range() {
        for v in [
            Viseme::Sil, Viseme::PP, Viseme::FF, Viseme::TH, Viseme::DD,
            Viseme::KK, Viseme::CH, Viseme::SS, Viseme::NN, Viseme::RR,
            Viseme::AA, Viseme::E, Viseme::I, Viseme::O, Viseme::U,
        ] {
            let (open, form) = v.mouth_shape();
            assert!((0.0..=1.0).contains(&open), "{v:?}");
            assert!((-1.0..=1.0).contains(&form), "{v:?}");
        }
        assert_eq!(Viseme::Sil.mouth_shape(), (0.0, 0.0));
    }

    #[test]
    fn vowels_open_wider_than_bilabials() {
        assert!(Viseme::AA.mouth_shape().0 > Viseme::PP.mouth_shape().0);
        assert!(Viseme::AA.is_vowel());
        assert!(!Viseme::SS.is_vowel());
    }

    #[test]
    fn estimated_timings_are_contiguous() {
        let timings = estimate_timings("HH AH0 L OW1", 1.0);
        assert_eq!(timings.len(), 4);
        assert_eq!(timings[0].start, Duration::ZERO);
        for pair in timings.windows(2) {
            let gap = (pair[1].start.as_secs_f32() - (pair[0].start + pair[0].duration).as_secs_f32()).abs();
            assert!(gap < 1e-4);
        }
        // Vowel "AH0" longer than the consonant "L".
        assert!(timings[1].duration > timings[2].duration);
    }

    #[test]
    fn faster_speech_shortens_timings() {
        let slow = estimate_timings("AA", 1.0);
        let fast = estimate_timings("AA", 2.0);
        assert!(fast[0].duration < slow[0].duration);
    }

    #[test]
    fn viseme_lookup_by_offset() {
        let timings = estimate_timings("M AA", 1.0);
        assert_eq!(viseme_at(&timings, Duration::from_millis(10)), Some(Viseme::PP));
        assert_eq!(viseme_at(&timings, Duration::from_millis(100)), Some(Viseme::AA));
        assert_eq!(viseme_at(&timings, Duration::from_secs(5)), None);
    }
}
