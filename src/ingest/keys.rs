//! Blocking-key derivation: normalized title prefixes and ISBN keys.

use unicode_normalization::UnicodeNormalization;

/// Maximum significant characters in a title key.
const TITLE_KEY_MAX_CHARS: usize = 25;
/// Long words (length > 3) counted before the title key is cut off.
const TITLE_KEY_MAX_LONG_WORDS: usize = 3;

/// Normalize a string for blocking-key comparison: lowercase, strip
/// diacritics, punctuation and control characters, collapse whitespace.
///
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.nfd() {
        if unicode_normalization::char::is_combining_mark(c) {
            continue;
        }
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if c.is_control() || c.is_ascii_punctuation() {
            continue;
        }
        if !c.is_alphanumeric() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        for lc in c.to_lowercase() {
            out.push(lc);
        }
    }
    out
}

/// Derive the title blocking key: the normalized title prefix up to either
/// three words longer than three characters or 25 significant characters,
/// whichever comes first. Whitespace is not significant in the key itself.
pub fn title_key(title: &str) -> Option<String> {
    let normalized = normalize(title);
    if normalized.is_empty() {
        return None;
    }

    let mut key = String::new();
    let mut long_words = 0;
    for word in normalized.split(' ') {
        key.push_str(word);
        if word.chars().count() > 3 {
            long_words += 1;
        }
        if long_words >= TITLE_KEY_MAX_LONG_WORDS || key.chars().count() >= TITLE_KEY_MAX_CHARS {
            break;
        }
    }
    if key.chars().count() > TITLE_KEY_MAX_CHARS {
        key = key.chars().take(TITLE_KEY_MAX_CHARS).collect();
    }
    Some(key)
}

/// Normalize an ISBN to its 13-digit form. ISBN-10s are promoted with the
/// standard 978 prefix; inputs failing their checksum are rejected.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'x' || *c == 'X')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match cleaned.len() {
        10 if valid_isbn10(&cleaned) => Some(isbn10_to_13(&cleaned)),
        13 if cleaned.chars().all(|c| c.is_ascii_digit()) && valid_isbn13(&cleaned) => {
            Some(cleaned)
        }
        _ => None,
    }
}

fn valid_isbn10(isbn: &str) -> bool {
    let mut sum = 0u32;
    for (i, c) in isbn.chars().enumerate() {
        let value = if c == 'X' {
            if i != 9 {
                return false;
            }
            10
        } else {
            match c.to_digit(10) {
                Some(d) => d,
                None => return false,
            }
        };
        sum += value * (10 - i as u32);
    }
    sum % 11 == 0
}

fn valid_isbn13(isbn: &str) -> bool {
    let digits: Vec<u32> = isbn.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 13 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
        .sum();
    sum % 10 == 0
}

/// Promote a valid ISBN-10 to ISBN-13.
fn isbn10_to_13(isbn10: &str) -> String {
    let mut digits: Vec<u32> = format!("978{}", &isbn10[..9])
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect();
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
        .sum();
    digits.push((10 - sum % 10) % 10);
    digits.into_iter().map(|d| char::from_digit(d, 10).unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_and_collapses() {
        assert_eq!(normalize("  The  Art, of: Computer!  "), "the art of computer");
        assert_eq!(normalize("Çüéâäà"), "cueaaa");
        assert_eq!(normalize("foo\tbar\u{0007}baz"), "foo barbaz");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for s in ["The Art of Computer Programming", "Tiedon käsittelyn perusteet", ""] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_title_key_prefix() {
        let key = title_key("The Art of Computer Programming").unwrap();
        assert_eq!(key, "theartofcomputerprogrammi");

        let key = title_key("Advanced Quantum Mechanics Explained Simply").unwrap();
        // three long words reached before the char cap
        assert_eq!(key, "advancedquantummechanics");
    }

    #[test]
    fn test_title_key_cuts_at_25_chars() {
        let key = title_key("aa bb cc dd ee ff gg hh ii jj kk ll mm").unwrap();
        assert!(key.chars().count() <= 25);
    }

    #[test]
    fn test_title_key_empty() {
        assert!(title_key("").is_none());
        assert!(title_key("!!!").is_none());
    }

    #[test]
    fn test_isbn10_promotion() {
        // TAOCP vol 1, hyphenated ISBN-10
        assert_eq!(normalize_isbn("0-201-03801-3").as_deref(), Some("9780201038019"));
        // X check digit
        assert_eq!(normalize_isbn("0-8044-2957-X").as_deref(), Some("9780804429573"));
    }

    #[test]
    fn test_isbn13_passthrough() {
        assert_eq!(normalize_isbn("978-0-201-03801-9").as_deref(), Some("9780201038019"));
    }

    #[test]
    fn test_invalid_isbn_rejected() {
        assert!(normalize_isbn("0-201-03801-4").is_none()); // bad checksum
        assert!(normalize_isbn("978-0-201-03801-8").is_none()); // bad checksum
        assert!(normalize_isbn("12345").is_none());
        assert!(normalize_isbn("").is_none());
    }
}
