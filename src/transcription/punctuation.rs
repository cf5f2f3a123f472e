//! Punctuation post-processing applied to each recognized span.

use std::str::FromStr;

/// Punctuation model selected by `model.punc_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punctuator {
    /// Keep the recognizer's punctuation as-is
    Native,
    /// Use full-width marks next to CJK text, so Chinese subtitles split on
    /// the punctuation readers expect
    CjkFullwidth,
}

impl FromStr for Punctuator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "none" => Ok(Punctuator::Native),
            "cjk-fullwidth" | "fullwidth" => Ok(Punctuator::CjkFullwidth),
            _ => Err(format!("Unknown punctuation model: {}", s)),
        }
    }
}

impl Punctuator {
    pub fn apply(&self, text: &str) -> String {
        match self {
            Punctuator::Native => text.to_string(),
            Punctuator::CjkFullwidth => to_fullwidth(text),
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3040}'..='\u{30ff}' | '\u{ac00}'..='\u{d7af}')
}

fn fullwidth(c: char) -> Option<char> {
    match c {
        ',' => Some('，'),
        '.' => Some('。'),
        '!' => Some('！'),
        '?' => Some('？'),
        ';' => Some('；'),
        ':' => Some('：'),
        _ => None,
    }
}

/// Replace ASCII marks that directly follow a CJK character, dropping the
/// space a recognizer often emits after them.
fn to_fullwidth(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous: Option<char> = None;
    let mut skip_space = false;

    for c in text.chars() {
        if skip_space && c == ' ' {
            skip_space = false;
            continue;
        }
        skip_space = false;

        match (previous, fullwidth(c)) {
            (Some(p), Some(wide)) if is_cjk(p) => {
                out.push(wide);
                previous = Some(wide);
                skip_space = true;
            }
            _ => {
                out.push(c);
                previous = Some(c);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("native".parse::<Punctuator>().unwrap(), Punctuator::Native);
        assert_eq!("CJK-Fullwidth".parse::<Punctuator>().unwrap(), Punctuator::CjkFullwidth);
        assert!("ct-punc".parse::<Punctuator>().is_err());
    }

    #[test]
    fn test_fullwidth_after_cjk() {
        let p = Punctuator::CjkFullwidth;
        assert_eq!(p.apply("你好, 世界."), "你好，世界。");
        assert_eq!(p.apply("真的吗?"), "真的吗？");
    }

    #[test]
    fn test_latin_text_untouched() {
        let p = Punctuator::CjkFullwidth;
        assert_eq!(p.apply(" Hello, world. 3.5"), " Hello, world. 3.5");
    }

    #[test]
    fn test_native_passthrough() {
        assert_eq!(Punctuator::Native.apply("你好, 世界"), "你好, 世界");
    }
}
