//! FILENAME: core/rollup-engine/src/key.rs
//! Node keys and the persisted key-list codec.
//!
//! A node key is the `::`-joined path of dimension values from the root to
//! the node (e.g. "Norway::Flex Repair"). Keys are minted only by the tree
//! builder via `child_key`; everything else parses them.
//!
//! Inside a segment `\` escapes a literal backslash or colon, so a value
//! like "Q1::Promo" stays one segment ("Q1\:\:Promo"). Values without
//! either character are written verbatim.
//!
//! Persisted expansion state is a comma-joined list of keys. Plain keys are
//! written verbatim; `\` escapes a literal backslash or comma, and `\-`
//! stands for the empty (root-level unknown) key.

use smallvec::SmallVec;

use crate::definition::DimensionValue;
use crate::error::RollupError;

pub const KEY_SEPARATOR: &str = "::";

const LIST_SEPARATOR: char = ',';
const ESCAPE: char = '\\';
const EMPTY_KEY_MARK: char = '-';
const SEGMENT_COLON: char = ':';

// ============================================================================
// NODE KEYS
// ============================================================================

/// Mints the key of a child of `parent` (or of a root when `parent` is None).
pub fn child_key(parent: Option<&str>, value: &DimensionValue) -> String {
    let segment = value.key_segment();
    let parent_len = parent.map_or(0, |p| p.len() + KEY_SEPARATOR.len());
    let mut key = String::with_capacity(parent_len + segment.len());
    if let Some(p) = parent {
        key.push_str(p);
        key.push_str(KEY_SEPARATOR);
    }
    for ch in segment.chars() {
        if ch == ESCAPE || ch == SEGMENT_COLON {
            key.push(ESCAPE);
        }
        key.push(ch);
    }
    key
}

/// Byte offsets of the unescaped separators in `key`.
fn separator_offsets(key: &str) -> SmallVec<[usize; 6]> {
    let bytes = key.as_bytes();
    let mut offsets = SmallVec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b':' if bytes.get(i + 1) == Some(&b':') => {
                offsets.push(i);
                i += KEY_SEPARATOR.len();
            }
            _ => i += 1,
        }
    }
    offsets
}

fn unescape_segment(raw: &str) -> DimensionValue {
    if !raw.contains(ESCAPE) {
        return DimensionValue::from_key_segment(raw);
    }
    let mut segment = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => segment.push(chars.next().unwrap_or(ESCAPE)),
            other => segment.push(other),
        }
    }
    DimensionValue::from_key_segment(&segment)
}

/// Depth of a key: the number of unescaped separators it contains.
pub fn key_depth(key: &str) -> usize {
    separator_offsets(key).len()
}

/// Splits a key back into its dimension values.
pub fn key_segments(key: &str) -> SmallVec<[DimensionValue; 6]> {
    let mut segments = SmallVec::new();
    let mut start = 0;
    for offset in separator_offsets(key) {
        segments.push(unescape_segment(&key[start..offset]));
        start = offset + KEY_SEPARATOR.len();
    }
    segments.push(unescape_segment(&key[start..]));
    segments
}

pub fn parent_key(key: &str) -> Option<&str> {
    separator_offsets(key).last().map(|&idx| &key[..idx])
}

/// Whether `key` lies strictly below `ancestor`.
pub fn is_ancestor(ancestor: &str, key: &str) -> bool {
    key.len() > ancestor.len()
        && key.starts_with(ancestor)
        && key[ancestor.len()..].starts_with(KEY_SEPARATOR)
}

/// Derives the ordered dimension→value filter selecting the rows under `key`.
pub fn parent_filter(
    dimensions: &[String],
    key: &str,
) -> Result<Vec<(String, DimensionValue)>, RollupError> {
    let segments = key_segments(key);
    if segments.len() > dimensions.len() {
        return Err(RollupError::InvalidKey {
            key: key.to_string(),
            reason: format!(
                "key has {} segments but only {} dimensions are active",
                segments.len(),
                dimensions.len()
            ),
        });
    }
    Ok(dimensions
        .iter()
        .cloned()
        .zip(segments)
        .collect())
}

// ============================================================================
// PERSISTED KEY LIST
// ============================================================================

/// Serializes keys into the persisted comma-joined form.
pub fn encode_key_list<I, S>(keys: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEPARATOR);
        }
        let key = key.as_ref();
        if key.is_empty() {
            out.push(ESCAPE);
            out.push(EMPTY_KEY_MARK);
            continue;
        }
        for ch in key.chars() {
            if ch == ESCAPE || ch == LIST_SEPARATOR {
                out.push(ESCAPE);
            }
            out.push(ch);
        }
    }
    out
}

/// Parses the persisted form. Empty input is an empty list; empty items
/// (stray commas) are skipped; duplicates keep their first position.
pub fn decode_key_list(raw: &str) -> Result<Vec<String>, RollupError> {
    let mut keys: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut explicit_empty = false;
    let mut chars = raw.chars();

    fn flush(current: &mut String, explicit_empty: &mut bool, keys: &mut Vec<String>) {
        if (!current.is_empty() || *explicit_empty) && !keys.iter().any(|k| *k == *current) {
            keys.push(std::mem::take(current));
        }
        current.clear();
        *explicit_empty = false;
    }

    while let Some(ch) = chars.next() {
        match ch {
            ESCAPE => match chars.next() {
                Some(ESCAPE) => current.push(ESCAPE),
                Some(LIST_SEPARATOR) => current.push(LIST_SEPARATOR),
                Some(EMPTY_KEY_MARK) if current.is_empty() => explicit_empty = true,
                Some(other) => {
                    return Err(RollupError::InvalidPersistedList(format!(
                        "unknown escape '\\{}'",
                        other
                    )))
                }
                None => {
                    return Err(RollupError::InvalidPersistedList(
                        "dangling escape at end of input".to_string(),
                    ))
                }
            },
            LIST_SEPARATOR => flush(&mut current, &mut explicit_empty, &mut keys),
            other => {
                if explicit_empty {
                    return Err(RollupError::InvalidPersistedList(
                        "empty-key marker followed by text".to_string(),
                    ));
                }
                current.push(other);
            }
        }
    }
    flush(&mut current, &mut explicit_empty, &mut keys);

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_key_and_depth() {
        let root = child_key(None, &DimensionValue::from("Norway"));
        let child = child_key(Some(&root), &DimensionValue::from("Flex Repair"));
        assert_eq!(root, "Norway");
        assert_eq!(child, "Norway::Flex Repair");
        assert_eq!(key_depth(&root), 0);
        assert_eq!(key_depth(&child), 1);
    }

    #[test]
    fn test_unknown_segment_is_empty() {
        let key = child_key(Some("NO"), &DimensionValue::Unknown);
        assert_eq!(key, "NO::");
        assert_eq!(key_depth(&key), 1);
        let segments = key_segments(&key);
        assert_eq!(segments[1], DimensionValue::Unknown);
    }

    #[test]
    fn test_parent_key_and_ancestry() {
        assert_eq!(parent_key("NO::A::x"), Some("NO::A"));
        assert_eq!(parent_key("NO"), None);
        assert!(is_ancestor("NO", "NO::A"));
        assert!(!is_ancestor("NO", "NORWAY::A"));
        assert!(!is_ancestor("NO", "NO"));
    }

    #[test]
    fn test_separator_inside_value_stays_one_segment() {
        let root = child_key(None, &DimensionValue::from("Q1::Promo"));
        assert_eq!(root, "Q1\\:\\:Promo");
        assert_eq!(key_depth(&root), 0);
        assert_eq!(parent_key(&root), None);
        assert_eq!(key_segments(&root).as_slice(), &[DimensionValue::from("Q1::Promo")]);

        let child = child_key(Some(&root), &DimensionValue::from("a\\b:"));
        assert_eq!(child, "Q1\\:\\:Promo::a\\\\b\\:");
        assert_eq!(key_depth(&child), 1);
        assert_eq!(parent_key(&child), Some(root.as_str()));
        assert!(is_ancestor(&root, &child));
        assert_eq!(key_segments(&child)[1], DimensionValue::from("a\\b:"));

        let dims = vec!["campaign".to_string(), "country".to_string()];
        assert_eq!(
            parent_filter(&dims, &root).unwrap(),
            vec![("campaign".to_string(), DimensionValue::from("Q1::Promo"))]
        );
    }

    #[test]
    fn test_escaped_keys_survive_the_persisted_list() {
        let key = child_key(None, &DimensionValue::from("Q1::Promo"));
        let encoded = encode_key_list([key.as_str(), "NO"]);
        assert_eq!(decode_key_list(&encoded).unwrap(), vec![key, "NO".to_string()]);
    }

    #[test]
    fn test_parent_filter_from_key() {
        let dims = vec!["country".to_string(), "product".to_string(), "campaign".to_string()];
        let filter = parent_filter(&dims, "NO::A").unwrap();
        assert_eq!(
            filter,
            vec![
                ("country".to_string(), DimensionValue::from("NO")),
                ("product".to_string(), DimensionValue::from("A")),
            ]
        );
        assert!(parent_filter(&dims[..1], "NO::A").is_err());
    }

    #[test]
    fn test_plain_keys_serialize_verbatim() {
        let encoded = encode_key_list(["Norway", "Norway::Flex Repair"]);
        assert_eq!(encoded, "Norway,Norway::Flex Repair");
        assert_eq!(
            decode_key_list(&encoded).unwrap(),
            vec!["Norway".to_string(), "Norway::Flex Repair".to_string()]
        );
    }

    #[test]
    fn test_special_characters_are_escaped() {
        let keys = vec!["a,b".to_string(), "c\\d".to_string(), String::new(), "x::".to_string()];
        let encoded = encode_key_list(&keys);
        assert_eq!(encoded, "a\\,b,c\\\\d,\\-,x::");
        assert_eq!(decode_key_list(&encoded).unwrap(), keys);
    }

    #[test]
    fn test_decode_is_tolerant_of_stray_commas_and_duplicates() {
        assert!(decode_key_list("").unwrap().is_empty());
        assert_eq!(
            decode_key_list("NO,,NO,SE,").unwrap(),
            vec!["NO".to_string(), "SE".to_string()]
        );
    }

    #[test]
    fn test_decode_rejects_bad_escapes() {
        assert!(decode_key_list("NO\\x").is_err());
        assert!(decode_key_list("NO\\").is_err());
        assert!(decode_key_list("\\-abc").is_err());
    }
}
