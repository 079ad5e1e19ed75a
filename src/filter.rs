//! Output filter.
//!
//! Mandatory redactor for key material in any outbound text. Three
//! detectors: raw hex private keys, BIP-39 mnemonic phrases (including
//! obfuscated forms), and JSON keystores. There is no bypass; every string
//! leaving the shield passes through here. Filtering is idempotent.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Replacement for redacted key material.
pub const REDACTED: &str = "[REDACTED BY WARDEX]";

/// Whole-output replacement when a keystore is detected.
pub const KEYSTORE_BLOCKED: &str = "[BLOCKED BY WARDEX: keystore material detected]";

/// Mnemonic lengths defined by BIP-39.
const MNEMONIC_LENGTHS: [usize; 5] = [24, 21, 18, 15, 12];

/// Fraction of tokens in a candidate window that must be BIP-39 words.
/// Guards against flagging ordinary prose.
const WORDLIST_RATIO: f64 = 0.4;

fn hex_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:0x)?[0-9a-fA-F]{64}\b").expect("hex key pattern compiles")
    })
}

fn keystore_crypto_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"crypto"\s*:"#).expect("keystore pattern compiles"))
}

fn keystore_cipher_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)"cipher(text)?"\s*:"#).expect("cipher pattern compiles"))
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z]+").expect("word pattern compiles"))
}

fn bip39_words() -> &'static HashSet<&'static str> {
    static WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    WORDS.get_or_init(|| {
        bip39::Language::English
            .word_list()
            .iter()
            .copied()
            .collect()
    })
}

/// Pure text sanitizer for key material.
#[derive(Debug, Clone, Default)]
pub struct OutputFilter;

impl OutputFilter {
    pub fn new() -> Self {
        Self
    }

    /// Sanitize one outbound string.
    pub fn apply(&self, text: &str) -> String {
        if self.is_keystore(text) {
            return KEYSTORE_BLOCKED.to_string();
        }
        let text = hex_key_regex().replace_all(text, REDACTED).into_owned();
        self.redact_mnemonics(&text)
    }

    /// Whether the text carries a JSON keystore. The entire output is
    /// blocked on match; partial emission of a keystore is never safe.
    fn is_keystore(&self, text: &str) -> bool {
        keystore_crypto_regex().is_match(text) && keystore_cipher_regex().is_match(text)
    }

    fn redact_mnemonics(&self, text: &str) -> String {
        // Alphabetic tokens with byte offsets; separators (whitespace,
        // punctuation, line breaks) are irrelevant, which is what defeats
        // the obfuscated forms.
        let tokens: Vec<(usize, usize, bool)> = word_regex()
            .find_iter(text)
            .map(|m| {
                let lower = m.as_str().to_lowercase();
                (m.start(), m.end(), bip39_words().contains(lower.as_str()))
            })
            .collect();

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let mut matched = false;
            for n in MNEMONIC_LENGTHS {
                if i + n > tokens.len() {
                    continue;
                }
                let window = &tokens[i..i + n];
                let hits = window.iter().filter(|(_, _, hit)| *hit).count();
                if (hits as f64) / (n as f64) >= WORDLIST_RATIO {
                    spans.push((window[0].0, window[n - 1].1));
                    i += n;
                    matched = true;
                    break;
                }
            }
            if !matched {
                i += 1;
            }
        }

        if spans.is_empty() {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in spans {
            result.push_str(&text[cursor..start]);
            result.push_str(REDACTED);
            cursor = end;
        }
        result.push_str(&text[cursor..]);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";

    fn filter() -> OutputFilter {
        OutputFilter::new()
    }

    #[test]
    fn test_hex_key_redacted() {
        let key = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
        let out = filter().apply(&format!("the key is {key} ok"));
        assert!(!out.contains("4c0883a6"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_bare_hex_key_redacted() {
        let key = "a".repeat(64);
        let out = filter().apply(&format!("key: {key}"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_shorter_hex_left_alone() {
        // A 64-char boundary matters: tx hashes are also 64 hex chars and
        // are intentionally caught; 40-char addresses are not.
        let address = "0x1111111111111111111111111111111111111111";
        let out = filter().apply(&format!("target {address}"));
        assert_eq!(out, format!("target {address}"));
    }

    #[test]
    fn test_mnemonic_redacted() {
        let out = filter().apply(&format!("your words: {MNEMONIC}"));
        assert!(!out.contains("abandon"));
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_mnemonic_mixed_case_redacted() {
        let shouty = MNEMONIC.to_uppercase();
        let out = filter().apply(&shouty);
        assert!(!out.contains("ABANDON"));
    }

    #[test]
    fn test_mnemonic_punctuation_separators_redacted() {
        let obfuscated = MNEMONIC.replace(' ', ", ");
        let out = filter().apply(&obfuscated);
        assert!(!out.contains("abandon"));
    }

    #[test]
    fn test_mnemonic_multiline_redacted() {
        let wrapped = MNEMONIC.replace(' ', "\n");
        let out = filter().apply(&wrapped);
        assert!(!out.contains("abandon"));
    }

    #[test]
    fn test_prose_not_flagged() {
        let prose = "Refactoring the serialization subsystem eliminated intermittent \
                     deserialization failures whenever malformed payloads arrived \
                     unexpectedly throughout integration testing cycles";
        let out = filter().apply(prose);
        assert_eq!(out, prose);
    }

    #[test]
    fn test_keystore_blocks_whole_output() {
        let keystore = r#"{"version":3,"crypto":{"cipher":"aes-128-ctr","ciphertext":"abcd"}}"#;
        let out = filter().apply(&format!("here is the file: {keystore}"));
        assert_eq!(out, KEYSTORE_BLOCKED);
    }

    #[test]
    fn test_plain_json_not_blocked() {
        let json = r#"{"decision":"approve","riskScore":12}"#;
        assert_eq!(filter().apply(json), json);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            format!("key {}", "b".repeat(64)),
            format!("phrase: {MNEMONIC}"),
            r#"{"crypto":{"cipher":"x"}}"#.to_string(),
            "perfectly ordinary text".to_string(),
        ];
        let f = filter();
        for input in inputs {
            let once = f.apply(&input);
            let twice = f.apply(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_15_word_mnemonic_redacted() {
        let phrase = "legal winner thank year wave sausage worth useful legal winner thank year wave sausage worth";
        let out = filter().apply(phrase);
        assert!(out.contains(REDACTED));
        assert!(!out.contains("sausage"));
    }
}
