//! `HfTokenizer` — Whisper vocabulary backed by a `tokenizer.json`.

use std::collections::BTreeSet;
use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Result, ScribeError};
use crate::inference::{SpecialTokens, TextTokenizer, TokenId};

/// Whisper language codes in vocabulary order.
const LANGUAGE_CODES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln", "ha",
    "ba", "jw", "su", "yue",
];

/// Punctuation and annotation marks that never stand for speech.
const NON_SPEECH_SYMBOLS: &[&str] = &[
    "\"", "#", "(", ")", "*", "+", "/", ":", ";", "<", "=", ">", "@", "[", "\\", "]", "^", "_",
    "`", "{", "|", "}", "~", "「", "」", "『", "』", "<<", ">>", "<<<", ">>>", "--", "---", "-(",
    "-[", "('", "(\"", "((", "))", "(((", ")))", "[[", "]]", "{{", "}}", "♪♪", "♪♪♪",
];
/// Musical notes, suppressed even when they split into several tokens.
const MUSIC_SYMBOLS: &[&str] = &["♩", "♪", "♫", "♬", "♭", "♮", "♯"];

pub struct HfTokenizer {
    inner: Tokenizer,
    specials: SpecialTokens,
}

impl HfTokenizer {
    /// # Errors
    /// `Inference` when the file cannot be parsed or lacks Whisper's
    /// control tokens.
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| ScribeError::Inference(format!("tokenizer {}: {e}", path.display())))?;
        let specials = {
            let encode = |text: &str| -> Vec<TokenId> {
                inner
                    .encode(text, false)
                    .map(|enc| enc.get_ids().to_vec())
                    .unwrap_or_default()
            };
            special_tokens(|name| inner.token_to_id(name), encode)?
        };
        Ok(Self { inner, specials })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        self.inner
            .encode(text, false)
            .map(|enc| enc.get_ids().to_vec())
            .map_err(|e| ScribeError::Inference(format!("tokenize: {e}")))
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| ScribeError::Inference(format!("detokenize: {e}")))
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.specials
    }
}

/// Resolve Whisper's control tokens by name.
fn special_tokens(
    lookup: impl Fn(&str) -> Option<TokenId>,
    encode: impl Fn(&str) -> Vec<TokenId>,
) -> Result<SpecialTokens> {
    let required = |name: &str| {
        lookup(name).ok_or_else(|| ScribeError::Inference(format!("tokenizer lacks {name}")))
    };
    let no_timestamps = required("<|notimestamps|>")?;

    let blank = match encode(" ").as_slice() {
        [single] => Some(*single),
        _ => None,
    };
    let languages = LANGUAGE_CODES
        .iter()
        .filter_map(|code| lookup(&format!("<|{code}|>")).map(|id| (code.to_string(), id)))
        .collect();

    Ok(SpecialTokens {
        eot: required("<|endoftext|>")?,
        sot: required("<|startoftranscript|>")?,
        sot_prev: required("<|startofprev|>")?,
        transcribe: required("<|transcribe|>")?,
        translate: required("<|translate|>")?,
        no_timestamps,
        no_speech: lookup("<|nospeech|>").or_else(|| lookup("<|nocaptions|>")),
        timestamp_begin: lookup("<|0.00|>").unwrap_or(no_timestamps + 1),
        blank,
        languages,
        non_speech: non_speech_tokens(&encode),
    })
}

fn non_speech_tokens(encode: &impl Fn(&str) -> Vec<TokenId>) -> Vec<TokenId> {
    let mut ids = BTreeSet::new();
    for lead in [" -", " '"] {
        if let Some(&id) = encode(lead).first() {
            ids.insert(id);
        }
    }
    for symbol in NON_SPEECH_SYMBOLS.iter().chain(MUSIC_SYMBOLS) {
        let music = MUSIC_SYMBOLS.contains(symbol);
        for tokens in [encode(symbol), encode(&format!(" {symbol}"))] {
            if tokens.len() == 1 || (music && !tokens.is_empty()) {
                ids.insert(tokens[0]);
            }
        }
    }
    ids.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vocab() -> HashMap<String, TokenId> {
        [
            ("<|endoftext|>", 50257),
            ("<|startoftranscript|>", 50258),
            ("<|en|>", 50259),
            ("<|de|>", 50261),
            ("<|translate|>", 50358),
            ("<|transcribe|>", 50359),
            ("<|startofprev|>", 50361),
            ("<|nospeech|>", 50362),
            ("<|notimestamps|>", 50363),
            ("<|0.00|>", 50364),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// One token per char, except spaced words which split in two.
    fn encode(text: &str) -> Vec<TokenId> {
        match text {
            " " => vec![220],
            " -" => vec![532],
            " '" => vec![705],
            "#" => vec![2],
            " #" => vec![1303],
            "<<" => vec![16],
            " <<" => vec![220, 16],
            "♪" => vec![17, 18],
            _ => vec![],
        }
    }

    #[test]
    fn control_tokens_resolve_by_name() {
        let v = vocab();
        let s = special_tokens(|n| v.get(n).copied(), encode).unwrap();
        assert_eq!(s.eot, 50257);
        assert_eq!(s.sot, 50258);
        assert_eq!(s.no_timestamps, 50363);
        assert_eq!(s.timestamp_begin, 50364);
        assert_eq!(s.no_speech, Some(50362));
        assert_eq!(s.blank, Some(220));
        assert_eq!(s.language_token("de"), Some(50261));
        assert_eq!(s.languages.len(), 2);
    }

    #[test]
    fn non_speech_keeps_single_token_symbols_and_music() {
        let ids = non_speech_tokens(&encode);
        assert!(ids.contains(&532));
        assert!(ids.contains(&705));
        assert!(ids.contains(&2));
        assert!(ids.contains(&1303));
        assert!(ids.contains(&16));
        assert!(ids.contains(&17));
        assert!(!ids.contains(&18));
    }

    #[test]
    fn missing_control_token_is_an_error() {
        let mut v = vocab();
        v.remove("<|startofprev|>");
        assert!(special_tokens(|n| v.get(n).copied(), encode).is_err());
    }
}
