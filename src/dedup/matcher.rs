//! Pairwise record matching rules.

use strsim::levenshtein;

use crate::drivers::RecordDriver;
use crate::ingest::keys::normalize;

/// Maximum scaled title distance, percent.
const TITLE_DISTANCE_THRESHOLD: f64 = 10.0;
/// Maximum scaled author distance, percent.
const AUTHOR_DISTANCE_THRESHOLD: f64 = 20.0;
/// Title comparison window, characters.
const TITLE_COMPARE_CHARS: usize = 255;

/// Decide whether two records describe the same resource.
///
/// A shared ISBN short-circuits to a match; otherwise every rule must
/// hold.
pub fn records_match(a: &dyn RecordDriver, b: &dyn RecordDriver) -> bool {
    if a.get_format() != b.get_format() {
        return false;
    }

    let isbns_a = a.get_isbns();
    let isbns_b = b.get_isbns();
    if !isbns_a.is_empty() && !isbns_b.is_empty() {
        // intersection decides on its own when both sides carry ISBNs
        return isbns_a.iter().any(|isbn| isbns_b.contains(isbn));
    }

    let issns_a = a.get_issns();
    let issns_b = b.get_issns();
    if !issns_a.is_empty()
        && !issns_b.is_empty()
        && !issns_a.iter().any(|issn| issns_b.contains(issn))
    {
        return false;
    }

    if let (Some(year_a), Some(year_b)) = (a.get_publication_year(), b.get_publication_year()) {
        if (year_a - year_b).abs() > 1 {
            return false;
        }
    }

    if let (Some(pages_a), Some(pages_b)) = (a.get_page_count(), b.get_page_count()) {
        if pages_a.abs_diff(pages_b) > 10 {
            return false;
        }
    }

    let series_issn_a = a.get_series_issn();
    let series_issn_b = b.get_series_issn();
    if !series_issn_a.is_empty() && !series_issn_b.is_empty() && series_issn_a != series_issn_b {
        return false;
    }
    let numbering_a = a.get_series_numbering();
    let numbering_b = b.get_series_numbering();
    if !numbering_a.is_empty() && !numbering_b.is_empty() && numbering_a != numbering_b {
        return false;
    }

    if !titles_match(&a.get_title(true), &b.get_title(true)) {
        return false;
    }

    authors_match(&a.get_main_author(), &b.get_main_author())
}

fn titles_match(title_a: &str, title_b: &str) -> bool {
    let a: String = normalize(title_a).chars().take(TITLE_COMPARE_CHARS).collect();
    let b: String = normalize(title_b).chars().take(TITLE_COMPARE_CHARS).collect();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    scaled_distance(&a, &b) < TITLE_DISTANCE_THRESHOLD
}

fn authors_match(author_a: &str, author_b: &str) -> bool {
    let a = normalize(author_a);
    let b = normalize(author_b);
    if a.is_empty() && b.is_empty() {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if surname_and_initial_match(&a, &b) {
        return true;
    }
    scaled_distance(&a, &b) <= AUTHOR_DISTANCE_THRESHOLD
}

/// "knuth donald e" vs "knuth d" style comparison: identical surname plus
/// matching first initial of the remainder.
fn surname_and_initial_match(a: &str, b: &str) -> bool {
    let (surname_a, rest_a) = match a.split_once(' ') {
        Some(pair) => pair,
        None => return false,
    };
    let (surname_b, rest_b) = match b.split_once(' ') {
        Some(pair) => pair,
        None => return false,
    };
    surname_a == surname_b && rest_a.chars().next() == rest_b.chars().next()
}

fn scaled_distance(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(a, b) as f64 * 100.0 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DcDriver;

    fn dc(title: &str, author: &str, isbn: &str, year: &str) -> DcDriver {
        let isbn_field = if isbn.is_empty() {
            String::new()
        } else {
            format!("<identifier>ISBN {isbn}</identifier>")
        };
        let xml = format!(
            "<dc><title>{title}</title><creator>{author}</creator>{isbn_field}\
             <date>{year}</date><type>Book</type></dc>"
        );
        DcDriver::parse(&xml, "", "s1").unwrap()
    }

    #[test]
    fn test_close_titles_match() {
        let a = dc("The Art of Computer Programming", "Knuth, Donald E.", "", "1997");
        let b = dc("Art of Computer Programming", "Knuth, D.", "", "1997");
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_shared_isbn_short_circuits_title_check() {
        // titles differ far beyond the 10% threshold
        let a = dc("Fundamental Algorithms", "Knuth, Donald E.", "0-201-03801-3", "1997");
        let b = dc("Completely Different Title Here", "Knuth, Donald E.", "9780201038019", "1997");
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_isbn_mismatch_rejects() {
        let a = dc("Same Title", "Knuth, Donald E.", "0-201-03801-3", "1997");
        let b = dc("Same Title", "Knuth, Donald E.", "951-0-18435-7", "1997");
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_distant_years_reject() {
        let a = dc("Same Exact Title", "Knuth, Donald E.", "", "1997");
        let b = dc("Same Exact Title", "Knuth, Donald E.", "", "2005");
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_adjacent_years_accepted() {
        let a = dc("Same Exact Title", "Knuth, Donald E.", "", "1997");
        let b = dc("Same Exact Title", "Knuth, Donald E.", "", "1998");
        assert!(records_match(&a, &b));
    }

    #[test]
    fn test_different_authors_reject() {
        let a = dc("Same Exact Title", "Knuth, Donald E.", "", "1997");
        let b = dc("Same Exact Title", "Dijkstra, Edsger W.", "", "1997");
        assert!(!records_match(&a, &b));
    }

    #[test]
    fn test_surname_initial_author_match() {
        assert!(authors_match("Knuth, Donald E.", "Knuth, D."));
        assert!(!authors_match("Knuth, Donald E.", "Knuth, Randall"));
        assert!(!authors_match("Knuth, Donald E.", ""));
    }
}
