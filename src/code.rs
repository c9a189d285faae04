/// One-time verification code generation and recognition.
///
/// Codes are drawn with the caller's RNG (OsRng at every real call site)
/// and are never logged.
use rand::Rng;
use rand_core::RngCore;
use regex::Regex;
use std::sync::OnceLock;

/// Number of digits in a verification code.
pub const CODE_LENGTH: usize = 6;

const CODE_SPACE: u32 = 1_000_000;

/// Generate a uniformly random, zero-padded 6-digit code.
pub fn generate_code(rng: &mut impl RngCore) -> String {
    let value = rng.gen_range(0..CODE_SPACE);
    format!("{:0width$}", value, width = CODE_LENGTH)
}

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{6}$").expect("static regex"))
}

/// Whether a piece of chat text is exactly a 6-digit code (surrounding whitespace allowed).
pub fn looks_like_code(text: &str) -> bool {
    code_pattern().is_match(text.trim())
}
