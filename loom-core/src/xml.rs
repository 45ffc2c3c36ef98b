//! Title extraction backing the `xml.firstTitle` built-in call op.

use quick_xml::events::Event;
use quick_xml::Reader;

/// First `<entry><title>` text in the document, falling back to the first
/// `<title>` anywhere. Malformed input yields the empty string; namespace
/// prefixes are ignored, so `atom:title` and `title` both match.
pub fn first_title(text: &str) -> String {
    let mut reader = Reader::from_str(text);
    let mut entry_depth = 0usize;
    let mut in_title = false;
    let mut current = String::new();
    let mut fallback: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"entry" => entry_depth += 1,
                b"title" => {
                    in_title = true;
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_title => match t.unescape() {
                Ok(s) => current.push_str(&s),
                Err(_) => return String::new(),
            },
            Ok(Event::CData(t)) if in_title => {
                current.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"entry" => entry_depth = entry_depth.saturating_sub(1),
                b"title" if in_title => {
                    in_title = false;
                    let title = current.trim().to_string();
                    if entry_depth > 0 {
                        return title;
                    }
                    if fallback.is_none() {
                        fallback = Some(title);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => return String::new(),
            Ok(_) => {}
        }
    }
    fallback.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_title_wins_over_the_feed_title() {
        let doc = r#"<?xml version="1.0"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
              <title>Feed heading</title>
              <entry><title>  First entry  </title></entry>
              <entry><title>Second entry</title></entry>
            </feed>"#;
        assert_eq!(first_title(doc), "First entry");
    }

    #[test]
    fn falls_back_to_any_title_without_entries() {
        let doc = "<feed><title>Only heading</title></feed>";
        assert_eq!(first_title(doc), "Only heading");
    }

    #[test]
    fn prefixed_names_match_by_local_name() {
        let doc = r#"<a:feed xmlns:a="http://www.w3.org/2005/Atom">
              <a:entry><a:title>Prefixed</a:title></a:entry>
            </a:feed>"#;
        assert_eq!(first_title(doc), "Prefixed");
    }

    #[test]
    fn malformed_or_empty_input_yields_empty() {
        assert_eq!(first_title(""), "");
        assert_eq!(first_title("not xml at all"), "");
        assert_eq!(first_title("<feed><entry><title>broken"), "");
    }
}
