//! Fixed interruption-phrase list. While the assistant is speaking, any
//! recognized text is checked against this before it can become a turn.

/// English and Spanish commands, acknowledgements and attention-getters that
/// a kiosk guest uses to cut the assistant off.
pub const INTERRUPTION_PHRASES: &[&str] = &[
    // English - direct commands
    "stop", "shut up", "be quiet", "quiet", "enough", "ok stop",
    "okay stop", "hold on", "wait", "pause", "never mind", "nevermind",
    "hang on", "one sec", "one second", "hey", "excuse me", "sorry",
    "actually", "um actually", "no no", "no wait",
    // English - acknowledgements and fillers
    "shh", "shhh", "hush", "silence", "that's enough", "okay okay",
    "ok ok", "got it", "i got it", "i get it", "thanks", "thank you",
    "skip", "next", "stop talking", "stop it", "quit it", "can you stop",
    "please stop", "alright", "all right", "yeah yeah", "yes yes",
    "i know", "i understand", "understood", "fine", "okay fine",
    "moving on", "let me", "let me speak", "my turn", "hold it",
    "wait wait", "whoa", "woah", "hey hey", "um", "uh", "hmm",
    // Spanish - direct commands
    "para", "párate", "basta", "espera", "cállate", "silencio",
    "un momento", "alto", "ya", "ya basta", "ya estuvo",
    // Spanish - attention / politeness
    "oye", "oiga", "perdón", "perdona", "disculpa", "disculpe",
    "gracias", "muchas gracias", "ok ya", "okay ya", "está bien",
    // Spanish - acknowledgements and fillers
    "momento", "espérate", "aguanta", "detente", "calla",
    "ya entendí", "ya sé", "entiendo", "entendido", "listo",
    "bueno", "bueno ya", "órale", "ándale", "sale", "va",
    "no espera", "un segundo", "tantito", "ahorita",
    "mira", "oyes", "este", "eh", "ah", "ey",
];

/// A phrase matches exactly, or as the leading or trailing word(s) of the
/// utterance. Substring matches in the middle do not count.
pub fn is_interruption(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    INTERRUPTION_PHRASES.iter().any(|phrase| {
        lower == *phrase
            || lower.starts_with(&format!("{phrase} "))
            || lower.ends_with(&format!(" {phrase}"))
    })
}
