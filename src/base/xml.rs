//! Minimal XML document queries for the list-bucket and multipart-upload
//! responses.

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed document: {0}")]
    Parse(#[from] quick_xml::Error),
}

/// Collects the text content of every element named `element`, in
/// document order. Element names are matched without their namespace
/// prefix.
pub fn find_all(document: &[u8], element: &str) -> Result<Vec<String>, XmlError> {
    let mut reader = Reader::from_reader(document);

    let mut found = Vec::new();
    let mut buf = Vec::new();
    let mut depth_in_match: usize = 0;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(start) => {
                if depth_in_match > 0 {
                    depth_in_match += 1;
                } else if start.local_name().as_ref() == element.as_bytes() {
                    depth_in_match = 1;
                    text.clear();
                }
            }
            Event::Text(t) => {
                if depth_in_match > 0 {
                    text.push_str(&t.unescape().map_err(quick_xml::Error::from)?);
                }
            }
            Event::End(_) => {
                if depth_in_match > 0 {
                    depth_in_match -= 1;

                    if depth_in_match == 0 {
                        found.push(std::mem::take(&mut text).trim().to_string());
                    }
                }
            }
            Event::Empty(empty) => {
                if depth_in_match == 0 && empty.local_name().as_ref() == element.as_bytes() {
                    found.push(String::new());
                }
            }
            _ => {}
        }

        buf.clear();
    }

    Ok(found)
}

pub fn find_first(document: &[u8], element: &str) -> Result<Option<String>, XmlError> {
    Ok(find_all(document, element)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>dir/a</Key><Size>12</Size></Contents>
  <Contents><Key>dir/b</Key><Size>0</Size></Contents>
  <CommonPrefixes><Prefix>dir/sub/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn finds_all_matching_elements() {
        let keys = find_all(LISTING.as_bytes(), "Key").unwrap();
        assert_eq!(keys, ["dir/a", "dir/b"]);

        let prefixes = find_all(LISTING.as_bytes(), "Prefix").unwrap();
        assert_eq!(prefixes, ["dir/sub/"]);
    }

    #[test]
    fn finds_first() {
        assert_eq!(
            find_first(LISTING.as_bytes(), "IsTruncated").unwrap().as_deref(),
            Some("false")
        );
        assert_eq!(find_first(LISTING.as_bytes(), "NextMarker").unwrap(), None);
    }

    #[test]
    fn unescapes_text() {
        let doc = "<r><Key>a&amp;b</Key></r>";
        assert_eq!(find_all(doc.as_bytes(), "Key").unwrap(), ["a&b"]);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(find_all(b"<open><nope></open>", "x").is_err());
    }
}
