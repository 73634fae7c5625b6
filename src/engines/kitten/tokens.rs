use std::collections::HashMap;
use std::path::Path;

use super::model::KittenError;

/// Load the phoneme vocabulary from a `tokens.txt` file.
///
/// Each line is a symbol followed by whitespace and its integer id. The space
/// symbol shows up as a line holding only the id.
pub fn load_tokens(path: &Path) -> Result<HashMap<char, i64>, KittenError> {
    let content = std::fs::read_to_string(path)?;
    parse_tokens(&content)
}

pub fn parse_tokens(content: &str) -> Result<HashMap<char, i64>, KittenError> {
    let mut map = HashMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let (symbol, id) = match line.rsplit_once(char::is_whitespace) {
            Some((symbol, id)) => (symbol, id),
            None => {
                return Err(KittenError::Tokens(format!(
                    "line {}: expected '<symbol> <id>', got {line:?}",
                    number + 1
                )))
            }
        };
        let id: i64 = id.trim().parse().map_err(|_| {
            KittenError::Tokens(format!("line {}: invalid id in {line:?}", number + 1))
        })?;
        let ch = symbol.chars().next().unwrap_or(' ');
        map.insert(ch, id);
    }

    if map.is_empty() {
        return Err(KittenError::Tokens("no tokens defined".to_string()));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::parse_tokens;

    #[test]
    fn parses_symbols_and_space() {
        let tokens = parse_tokens("$ 0\n; 1\n  16\nə 83\n").unwrap();
        assert_eq!(tokens.get(&'$'), Some(&0));
        assert_eq!(tokens.get(&';'), Some(&1));
        assert_eq!(tokens.get(&' '), Some(&16));
        assert_eq!(tokens.get(&'ə'), Some(&83));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_tokens("a b\n").is_err());
        assert!(parse_tokens("\n\n").is_err());
        assert!(parse_tokens("abc\n").is_err());
    }
}
