use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::model::KittenError;

/// Where to find espeak-ng. `None` fields fall back to the system install.
#[derive(Debug, Clone, Default)]
pub struct EspeakConfig {
    pub bin_path: Option<PathBuf>,
    pub data_path: Option<PathBuf>,
}

impl EspeakConfig {
    fn command(&self) -> Command {
        let mut command = match &self.bin_path {
            Some(path) => Command::new(path),
            None => Command::new("espeak-ng"),
        };
        if let Some(data) = &self.data_path {
            command.env("ESPEAK_DATA_PATH", data);
        }
        command
    }

    /// Whether the configured binary can be launched.
    pub fn is_available(&self) -> bool {
        self.command().arg("--version").output().is_ok()
    }
}

/// Split `text` into sentences, keeping each sentence's closing punctuation.
///
/// A decimal point between digits does not end a sentence. Line breaks
/// always do.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for (idx, ch) in text.char_indices() {
        if ch == '\n' || ch == '\r' {
            flush_sentence(&mut sentences, &mut current);
            continue;
        }
        if ch.is_whitespace() {
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            continue;
        }

        current.push(ch);
        if matches!(ch, '.' | '!' | '?') && !is_between_digits(text, idx, ch) {
            flush_sentence(&mut sentences, &mut current);
        }
    }

    flush_sentence(&mut sentences, &mut current);
    sentences
}

fn flush_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if trimmed.is_empty() {
        current.clear();
        return;
    }
    // A lone run of punctuation ("...", "?!") belongs to the previous sentence.
    if trimmed.chars().all(|c| matches!(c, '.' | '!' | '?')) {
        if let Some(last) = sentences.last_mut() {
            last.push_str(trimmed);
        }
    } else {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn is_between_digits(text: &str, idx: usize, ch: char) -> bool {
    if ch != '.' {
        return false;
    }
    let prev = text[..idx].chars().next_back();
    let next = text[idx + ch.len_utf8()..].chars().next();
    matches!(
        (prev, next),
        (Some(left), Some(right)) if left.is_ascii_digit() && right.is_ascii_digit()
    )
}

/// Convert one sentence to Kitten token ids via espeak-ng.
///
/// Symbols missing from `tokens` are dropped. The sentence's closing
/// punctuation is re-appended since espeak-ng strips it.
pub fn phonemize(
    sentence: &str,
    lang: &str,
    tokens: &HashMap<char, i64>,
    espeak: &EspeakConfig,
) -> Result<Vec<i64>, KittenError> {
    let body = sentence.trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'));
    let closing: Vec<char> = sentence[body.len()..].chars().collect();
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let ipa = run_espeak(body, lang, espeak)?;
    let mut ids = ipa_to_ids(&ipa, tokens);
    ids.extend(closing.iter().filter_map(|c| tokens.get(c).copied()));
    Ok(ids)
}

fn run_espeak(input: &str, lang: &str, espeak: &EspeakConfig) -> Result<String, KittenError> {
    let mut child = espeak
        .command()
        .args(["--ipa", "--stdin", "-q", "-v", lang])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KittenError::EspeakNotFound
            } else {
                KittenError::Io(e)
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // espeak-ng under-processes a final line that has no terminator.
        stdin.write_all(newline_terminated(input).as_bytes())?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KittenError::PhonemizerFailed(format!(
            "espeak-ng exited with code {:?}: {stderr}",
            output.status.code()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn newline_terminated(input: &str) -> Cow<'_, str> {
    if input.ends_with('\n') {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(format!("{input}\n"))
    }
}

/// Map IPA output to ids, joining espeak-ng's output lines with a space.
fn ipa_to_ids(ipa: &str, tokens: &HashMap<char, i64>) -> Vec<i64> {
    let space = tokens.get(&' ').copied();
    let mut ids = Vec::new();
    for line in ipa.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !ids.is_empty() {
            ids.extend(space);
        }
        ids.extend(
            line.chars()
                .filter(|&c| c != '_')
                .filter_map(|c| tokens.get(&c).copied()),
        );
    }
    ids
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{ipa_to_ids, newline_terminated, phonemize, split_sentences, EspeakConfig};

    #[test]
    fn splits_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hello there. How are you? Fine!"),
            vec!["Hello there.", "How are you?", "Fine!"]
        );
    }

    #[test]
    fn keeps_decimals_and_ellipses_together() {
        assert_eq!(
            split_sentences("Version 2.5 is out... Nice"),
            vec!["Version 2.5 is out...", "Nice"]
        );
    }

    #[test]
    fn line_breaks_end_sentences() {
        assert_eq!(split_sentences("one\ntwo  three\n\n"), vec!["one", "two three"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn terminates_stdin_payload() {
        assert_eq!(newline_terminated("America"), "America\n");
        assert_eq!(newline_terminated("America\n"), "America\n");
    }

    #[test]
    fn maps_ipa_and_skips_unknown_symbols() {
        let tokens: HashMap<char, i64> = [(' ', 16), ('h', 50), ('ə', 83)].into_iter().collect();
        assert_eq!(ipa_to_ids("hə_x\nhə\n", &tokens), vec![50, 83, 16, 50, 83]);
    }

    #[test]
    fn phonemize_keeps_closing_punctuation() {
        let espeak = EspeakConfig::default();
        // Skip when espeak-ng is unavailable in the execution environment.
        if !espeak.is_available() {
            return;
        }
        let tokens: HashMap<char, i64> = [('?', 6), ('ə', 83)].into_iter().collect();
        let ids = phonemize("America?", "en-us", &tokens, &espeak).expect("espeak should succeed");
        assert_eq!(ids.last(), Some(&6));
        assert!(ids.contains(&83));
    }
}
