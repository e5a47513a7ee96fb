//! Endpointing: deciding where an utterance ends. The silence window and
//! word floor adapt to an ambient-noise estimate supplied from outside;
//! how that estimate is produced is not this crate's business.

use std::time::Duration;

use crate::config::Tuning;

/// Externally-supplied ambient noise level, on the 0-100-ish RMS scale the
/// adjustment bands below expect.
pub trait NoiseEstimate: Send + Sync {
    fn ambient_level(&self) -> f32;
}

/// A constant estimate; the default when no monitor is wired in.
pub struct FixedNoise(pub f32);

impl NoiseEstimate for FixedNoise {
    fn ambient_level(&self) -> f32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveSettings {
    pub silence_window: Duration,
    pub min_words: usize,
}

/// Louder rooms get longer silence windows and a higher word floor, so a
/// stray syllable of crowd noise does not end someone's sentence.
pub fn adaptive_settings(tuning: &Tuning, ambient: f32) -> AdaptiveSettings {
    let base_window = tuning.silence_window;
    let base_words = tuning.min_words_for_send;
    if ambient < 15.0 {
        AdaptiveSettings {
            silence_window: base_window,
            min_words: base_words,
        }
    } else if ambient < 30.0 {
        AdaptiveSettings {
            silence_window: base_window + Duration::from_millis(500),
            min_words: base_words,
        }
    } else if ambient < 50.0 {
        AdaptiveSettings {
            silence_window: base_window + Duration::from_millis(1000),
            min_words: base_words.max(3),
        }
    } else {
        AdaptiveSettings {
            silence_window: base_window + Duration::from_millis(1500),
            min_words: base_words.max(4),
        }
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

const FILLER_WORDS: &[&str] = &["the", "a", "uh", "um", "oh", "ah", "hmm", "huh"];

/// In a noisy room, a single low-confidence word (or a known filler) is
/// far more likely to be the crowd than the guest.
pub fn is_likely_noise(text: &str, confidence: f32, ambient: f32) -> bool {
    if ambient <= 30.0 {
        return false;
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() != 1 {
        return false;
    }
    if confidence < 0.7 {
        return true;
    }
    FILLER_WORDS.contains(&words[0].to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_scale_with_ambient_noise() {
        let tuning = Tuning::default();
        let quiet = adaptive_settings(&tuning, 5.0);
        assert_eq!(quiet.silence_window, tuning.silence_window);
        assert_eq!(quiet.min_words, tuning.min_words_for_send);

        let loud = adaptive_settings(&tuning, 80.0);
        assert!(loud.silence_window > quiet.silence_window);
        assert!(loud.min_words >= 4);
    }

    #[test]
    fn noise_filter_only_applies_in_noisy_rooms() {
        assert!(!is_likely_noise("um", 0.2, 10.0));
        assert!(is_likely_noise("um", 0.95, 40.0));
        assert!(is_likely_noise("word", 0.5, 40.0));
        assert!(!is_likely_noise("turn the lights on", 0.5, 40.0));
    }
}
