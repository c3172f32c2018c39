use std::path::Path;

use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;

use crate::error::{PoolError, Result};
use crate::models::HostDefinition;

/// Parse one host-definition file into a `HostDefinition`. The host name is
/// the file name minus its extension; the file must declare exactly one
/// non-empty `<label>` element. Round trip: parsing a definition's own
/// `declaring_file_name`/`raw_definition` yields an equal definition.
pub fn parse(file_name: &str, raw: &str) -> Result<HostDefinition> {
    let name = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(invalid(file_name, "file name yields an empty host name"));
    }

    let labels = extract_labels(file_name, raw)?;
    let label = match labels.as_slice() {
        [one] => one.clone(),
        [] => return Err(invalid(file_name, "no <label> element")),
        _ => {
            return Err(invalid(
                file_name,
                &format!("{} <label> elements, expected exactly one", labels.len()),
            ))
        }
    };
    if label.is_empty() {
        return Err(invalid(file_name, "<label> is empty"));
    }

    Ok(HostDefinition {
        name,
        label,
        declaring_file_name: file_name.to_string(),
        raw_definition: raw.to_string(),
    })
}

fn extract_labels(file_name: &str, raw: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(raw);
    let mut labels = Vec::new();
    let mut label_depth = 0usize;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"label" {
                    label_depth += 1;
                    current.clear();
                }
            }
            Ok(Event::Text(t)) => {
                if label_depth > 0 {
                    let text = t
                        .decode()
                        .map_err(|e| invalid(file_name, &format!("bad text content: {e}")))?;
                    current.push_str(&text);
                }
            }
            // Entity and character references arrive as their own events.
            Ok(Event::GeneralRef(r)) => {
                if label_depth > 0 {
                    current.push(resolve_reference(file_name, &r)?);
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"label" && label_depth > 0 {
                    label_depth -= 1;
                    if label_depth == 0 {
                        labels.push(current.trim().to_string());
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"label" {
                    labels.push(String::new());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(invalid(file_name, &format!("malformed XML: {e}"))),
        }
    }

    Ok(labels)
}

fn resolve_reference(file_name: &str, reference: &BytesRef<'_>) -> Result<char> {
    if let Some(ch) = reference
        .resolve_char_ref()
        .map_err(|e| invalid(file_name, &format!("bad character reference: {e}")))?
    {
        return Ok(ch);
    }
    let name = reference
        .decode()
        .map_err(|e| invalid(file_name, &format!("bad entity reference: {e}")))?;
    match name.as_ref() {
        "amp" => Ok('&'),
        "lt" => Ok('<'),
        "gt" => Ok('>'),
        "apos" => Ok('\''),
        "quot" => Ok('"'),
        other => Err(invalid(
            file_name,
            &format!("unresolvable entity reference '&{other};'"),
        )),
    }
}

fn invalid(file_name: &str, reason: &str) -> PoolError {
    PoolError::HostDefinition {
        file: file_name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_definition() {
        let raw = "<slave><name>winA</name><label>windows</label></slave>";
        let def = parse("winA.xml", raw).unwrap();
        assert_eq!(def.name, "winA");
        assert_eq!(def.label, "windows");
        assert_eq!(def.declaring_file_name, "winA.xml");
        assert_eq!(def.raw_definition, raw);
    }

    #[test]
    fn label_is_trimmed() {
        let def = parse("solB.xml", "<slave><label>  solaris \n</label></slave>").unwrap();
        assert_eq!(def.label, "solaris");
    }

    #[test]
    fn round_trip() {
        let raw = "<slave><label>windows,2019</label><remoteFS>/build</remoteFS></slave>";
        let def = parse("winA.xml", raw).unwrap();
        let again = parse(&def.declaring_file_name, &def.raw_definition).unwrap();
        assert_eq!(def, again);
    }

    #[test]
    fn missing_label_rejected() {
        let err = parse("h.xml", "<slave><name>h</name></slave>").unwrap_err();
        assert!(err.to_string().contains("no <label>"));
    }

    #[test]
    fn empty_label_rejected() {
        assert!(parse("h.xml", "<slave><label></label></slave>").is_err());
        assert!(parse("h.xml", "<slave><label>   </label></slave>").is_err());
        assert!(parse("h.xml", "<slave><label/></slave>").is_err());
    }

    #[test]
    fn multiple_labels_rejected() {
        let raw = "<slave><label>a</label><label>b</label></slave>";
        let err = parse("h.xml", raw).unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn malformed_xml_rejected() {
        assert!(parse("h.xml", "<slave><label>a</slave>").is_err());
    }

    #[test]
    fn escaped_text_is_unescaped() {
        let def = parse("h.xml", "<slave><label>a&amp;b</label></slave>").unwrap();
        assert_eq!(def.label, "a&b");
    }

    #[test]
    fn character_references_are_resolved() {
        let def = parse("h.xml", "<slave><label>a&#38;b&#x26;c</label></slave>").unwrap();
        assert_eq!(def.label, "a&b&c");
    }

    #[test]
    fn unresolvable_entity_rejected() {
        let err = parse("h.xml", "<slave><label>&bogus;</label></slave>").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
