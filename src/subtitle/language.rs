//! Script-based language detection for the `lang` field.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
    Ja,
    Ko,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
            Language::Ja => "ja",
            Language::Ko => "ko",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_cjk_ideograph(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn is_kana(c: char) -> bool {
    ('\u{3040}'..='\u{30ff}').contains(&c)
}

fn is_hangul(c: char) -> bool {
    ('\u{ac00}'..='\u{d7af}').contains(&c)
}

/// Classify text by script.
///
/// Any kana means Japanese and any Hangul means Korean, since both scripts
/// are unique to their language while Japanese text is also full of CJK
/// ideographs. Otherwise the text is Chinese when the share of ideographs
/// among non-whitespace characters reaches `chinese_ratio_threshold`, and
/// English when it does not.
pub fn detect_language(text: &str, chinese_ratio_threshold: f64) -> Language {
    let mut total = 0usize;
    let mut cjk = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;

    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if is_cjk_ideograph(c) {
            cjk += 1;
        } else if is_kana(c) {
            kana += 1;
        } else if is_hangul(c) {
            hangul += 1;
        }
    }

    if kana > 0 {
        return Language::Ja;
    }
    if hangul > 0 {
        return Language::Ko;
    }

    let cjk_ratio = if total > 0 {
        cjk as f64 / total as f64
    } else {
        0.0
    };

    if total > 0 && cjk_ratio >= chinese_ratio_threshold {
        Language::Zh
    } else {
        Language::En
    }
}
