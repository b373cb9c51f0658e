//! Word codes: short human-typable session codes of the form `N-word-word`,
//! and the two one-way derivations taken from them.

use std::fmt;
use std::str::FromStr;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::kdf;

/// Highest channel number a code may carry.
pub const MAX_CHANNEL: u8 = 99;

const LOOKUP_LABEL: &[u8] = b"x11q/rendezvous/lookup/v1";
const PASSWORD_SALT: &[u8] = b"x11q/pake/password/v1";
const PASSWORD_INFO: &[u8] = b"spake2-ed25519 password";

/// Fixed dictionary, sorted so lookups can binary search.
pub const WORDLIST: [&str; 256] = [
    "acid", "acorn", "actor", "adobe", "agent", "alarm", "album", "alley",
    "amber", "anchor", "angle", "apple", "apron", "arena", "arrow", "aspen",
    "atlas", "attic", "autumn", "badge", "bagel", "baker", "bamboo", "banjo",
    "barley", "basin", "beach", "beacon", "beard", "berry", "bison", "blade",
    "blanket", "blaze", "bloom", "board", "bonus", "border", "bottle", "brain",
    "brass", "bread", "brick", "bridge", "broom", "brush", "bucket", "bugle",
    "cabin", "cactus", "camel", "candle", "canoe", "canyon", "carbon", "cargo",
    "carpet", "castle", "cedar", "cello", "chalk", "chant", "cherry", "chess",
    "cider", "cinema", "circle", "clay", "cliff", "clock", "cloud", "clover",
    "cobra", "comet", "coral", "cotton", "cousin", "crane", "crater", "crayon",
    "cricket", "crown", "crystal", "daisy", "dance", "delta", "denim", "desert",
    "diamond", "dinner", "dolphin", "donkey", "dragon", "dream", "drum", "eagle",
    "echo", "elbow", "ember", "engine", "falcon", "feather", "fender", "fiddle",
    "fjord", "flame", "flint", "forest", "fossil", "fountain", "fox", "frost",
    "galaxy", "garden", "garlic", "gecko", "geyser", "ginger", "glacier", "globe",
    "goblin", "grape", "gravel", "harbor", "harp", "hazel", "helmet", "heron",
    "hockey", "honey", "hornet", "hotel", "husky", "igloo", "island", "ivory",
    "jacket", "jaguar", "jelly", "jewel", "jungle", "kayak", "kernel", "kettle",
    "kiwi", "koala", "ladder", "lagoon", "lamp", "lantern", "laser", "lemon",
    "lens", "lily", "linen", "lizard", "lobster", "locket", "lotus", "lunar",
    "magnet", "mango", "maple", "marble", "meadow", "melon", "meteor", "mirror",
    "mitten", "monkey", "moose", "mosaic", "motor", "muffin", "nectar", "needle",
    "nickel", "noodle", "nutmeg", "oasis", "ocean", "olive", "onion", "orbit",
    "orchid", "otter", "oyster", "paddle", "panda", "paper", "parrot", "peach",
    "pebble", "pepper", "piano", "pickle", "pilot", "pine", "planet", "plum",
    "pocket", "polar", "poppy", "prism", "puffin", "pumpkin", "quartz", "quill",
    "rabbit", "radar", "raven", "ribbon", "river", "robin", "rocket", "ruby",
    "saddle", "salmon", "sand", "saturn", "scarf", "shadow", "shell", "silver",
    "sketch", "sonic", "spider", "spoon", "squid", "statue", "storm", "sugar",
    "summit", "tango", "temple", "thunder", "tiger", "timber", "toast", "tomato",
    "topaz", "torch", "tulip", "tunnel", "turtle", "umbrella", "valley", "velvet",
    "violin", "walnut", "whale", "willow", "window", "wizard", "yacht", "zebra",
];

/// A session code. Generated per session by the serving side and consumed
/// once by the joining side.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WordCode {
    channel: u8,
    words: [u8; 2],
}

impl WordCode {
    /// Draw a fresh code from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        WordCode {
            channel: rng.gen_range(0..=MAX_CHANNEL),
            words: [rng.gen(), rng.gen()],
        }
    }

    pub fn from_parts(channel: u8, words: [u8; 2]) -> Result<Self, CodeError> {
        if channel > MAX_CHANNEL {
            return Err(CodeError::InvalidFormat);
        }
        Ok(WordCode { channel, words })
    }

    /// Parse the canonical form, ignoring case and surrounding whitespace.
    pub fn parse(text: &str) -> Result<Self, CodeError> {
        let mut parts = text.trim().split('-');
        let (Some(channel), Some(first), Some(second), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CodeError::InvalidFormat);
        };
        if channel.is_empty() || channel.len() > 2 || !channel.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(CodeError::InvalidFormat);
        }
        let channel: u8 = channel.parse().map_err(|_| CodeError::InvalidFormat)?;
        if first.is_empty() || second.is_empty() {
            return Err(CodeError::InvalidFormat);
        }
        let words = [word_index(first, 1)?, word_index(second, 2)?];
        Self::from_parts(channel, words)
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn words(&self) -> [&'static str; 2] {
        [
            WORDLIST[self.words[0] as usize],
            WORDLIST[self.words[1] as usize],
        ]
    }

    fn canonical(&self) -> Zeroizing<String> {
        Zeroizing::new(self.to_string())
    }
}

fn word_index(token: &str, position: usize) -> Result<u8, CodeError> {
    let lower = Zeroizing::new(token.to_ascii_lowercase());
    WORDLIST
        .binary_search(&lower.as_str())
        .ok()
        .and_then(|i| u8::try_from(i).ok())
        .ok_or(CodeError::UnknownWord { position })
}

impl fmt::Display for WordCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b] = self.words();
        write!(f, "{}-{}-{}", self.channel, a, b)
    }
}

impl fmt::Debug for WordCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WordCode(<redacted>)")
    }
}

impl FromStr for WordCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WordCode::parse(s)
    }
}

/// Bad code input. Neither variant carries the typed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    #[error("code must look like N-word-word with N from 0 to 99")]
    InvalidFormat,
    #[error("word {position} of the code is not in the dictionary")]
    UnknownWord { position: usize },
}

/// Fixed-width key under which the serving side publishes its record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupKey(#[serde(with = "crate::identity::bytes_32")] [u8; 32]);

impl LookupKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        LookupKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LookupKey({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for LookupKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(LookupKey(out))
    }
}

/// PAKE password material. Zeroized on drop.
#[derive(Clone)]
pub struct CodePassword(Zeroizing<[u8; 32]>);

impl CodePassword {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CodePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodePassword(<redacted>)")
    }
}

/// Public directory key: domain-separated SHA-256 of the canonical code.
pub fn derive_lookup_key(code: &WordCode) -> LookupKey {
    let canonical = code.canonical();
    let mut hasher = Sha256::new();
    hasher.update(LOOKUP_LABEL);
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    LookupKey(hasher.finalize().into())
}

/// Secret PAKE input: HKDF-SHA256 of the canonical code under its own salt and label.
pub fn derive_password(code: &WordCode) -> CodePassword {
    let canonical = code.canonical();
    let hk = Hkdf::<Sha256>::new(Some(PASSWORD_SALT), canonical.as_bytes());
    let mut out = Zeroizing::new([0u8; 32]);
    kdf::expand(&hk, &[PASSWORD_INFO], &mut out[..]);
    CodePassword(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wordlist_sorted_unique() {
        assert!(WORDLIST.windows(2).all(|w| w[0] < w[1]));
        assert!(WORDLIST.contains(&"tiger"));
        assert!(WORDLIST.contains(&"lamp"));
    }

    #[test]
    fn parse_canonical_and_case_insensitive() {
        let code = WordCode::parse("7-tiger-lamp").unwrap();
        assert_eq!(code.channel(), 7);
        assert_eq!(code.words(), ["tiger", "lamp"]);
        assert_eq!(WordCode::parse("  7-TIGER-Lamp\n").unwrap(), code);
        assert_eq!(WordCode::parse("07-tiger-lamp").unwrap(), code);
        assert_eq!(code.to_string(), "7-tiger-lamp");
    }

    #[test]
    fn parse_rejects_bad_shape() {
        for bad in [
            "",
            "tiger-lamp",
            "7-tiger",
            "7-tiger-lamp-x",
            "7--lamp",
            "-tiger-lamp",
            "+7-tiger-lamp",
            "100-tiger-lamp",
            "x-tiger-lamp",
            "7 tiger lamp",
        ] {
            assert_eq!(WordCode::parse(bad), Err(CodeError::InvalidFormat), "{bad:?}");
        }
    }

    #[test]
    fn parse_reports_unknown_word_position() {
        assert_eq!(
            WordCode::parse("7-tigre-lamp"),
            Err(CodeError::UnknownWord { position: 1 })
        );
        assert_eq!(
            WordCode::parse("7-tiger-lump"),
            Err(CodeError::UnknownWord { position: 2 })
        );
    }

    #[test]
    fn debug_and_errors_hide_the_code() {
        let code = WordCode::parse("7-tiger-lamp").unwrap();
        assert!(!format!("{:?}", code).contains("tiger"));
        let err = WordCode::parse("7-tigre-lamp").unwrap_err();
        assert!(!err.to_string().contains("tigre"));
        let password = derive_password(&code);
        assert!(!format!("{:?}", password).contains(&hex::encode(&password.as_bytes()[..4])));
    }

    #[test]
    fn derivations_are_deterministic() {
        let a = WordCode::parse("7-tiger-lamp").unwrap();
        let b = WordCode::parse("7-Tiger-Lamp").unwrap();
        assert_eq!(derive_lookup_key(&a), derive_lookup_key(&b));
        assert_eq!(derive_password(&a).as_bytes(), derive_password(&b).as_bytes());
        let c = WordCode::parse("8-tiger-lamp").unwrap();
        assert_ne!(derive_lookup_key(&a), derive_lookup_key(&c));
    }

    #[test]
    fn lookup_key_hex_roundtrip() {
        let key = derive_lookup_key(&WordCode::generate());
        assert_eq!(key.to_string().parse::<LookupKey>().unwrap(), key);
    }

    fn any_code() -> impl Strategy<Value = WordCode> {
        (0..=MAX_CHANNEL, any::<u8>(), any::<u8>())
            .prop_map(|(n, a, b)| WordCode::from_parts(n, [a, b]).unwrap())
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(code in any_code()) {
            prop_assert_eq!(WordCode::parse(&code.to_string()).unwrap(), code);
        }

        #[test]
        fn password_and_lookup_key_are_unrelated(code in any_code()) {
            let key = derive_lookup_key(&code);
            let password = derive_password(&code);
            prop_assert_ne!(key.as_bytes(), password.as_bytes());
            // Neither output is the other hashed again under either construction.
            let mut rehash = Sha256::new();
            rehash.update(LOOKUP_LABEL);
            rehash.update([0u8]);
            rehash.update(password.as_bytes());
            let rehash: [u8; 32] = rehash.finalize().into();
            prop_assert_ne!(&rehash, key.as_bytes());
            let differing_bytes = key
                .as_bytes()
                .iter()
                .zip(password.as_bytes().iter())
                .filter(|(a, b)| a != b)
                .count();
            prop_assert!(differing_bytes > 16);
        }
    }

    #[test]
    fn generated_codes_roundtrip() {
        for _ in 0..200 {
            let code = WordCode::generate();
            assert!(code.channel() <= MAX_CHANNEL);
            assert_eq!(WordCode::parse(&code.to_string()).unwrap(), code);
        }
    }
}
