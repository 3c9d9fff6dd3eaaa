//! Identity name normalization and the file-name convention for reference images.
//!
//! A display name such as `"Alice Smith"` is stored on disk under the key
//! `"Alice_Smith"`. Reading a key back converts underscores to spaces and
//! title-cases the result, so `alice_smith.jpg` and `Alice_Smith.jpg` both
//! load as `"Alice Smith"`.

/// Length of the hex content tag appended to stored reference images.
pub const CONTENT_TAG_LEN: usize = 8;

/// Normalize a user-supplied name into its display form.
///
/// Underscores become spaces, runs of whitespace collapse to one space, and
/// each alphabetic run starts upper-case with the remainder lower-case.
/// Returns `None` if nothing is left, or if the name contains a path
/// separator or a control character.
pub fn display_name(raw: &str) -> Option<String> {
    if raw
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return None;
    }

    let spaced = raw.replace('_', " ");
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.starts_with('.') {
        return None;
    }
    Some(title_case(&collapsed))
}

/// Storage key for a display name: spaces replaced by underscores.
pub fn storage_key(display: &str) -> String {
    display.replace(' ', "_")
}

/// Recover the display name from a reference image file name.
///
/// Accepts both `Alice_Smith.jpg` and the tagged form
/// `Alice_Smith.1a2b3c4d.jpg` written by enrollment.
pub fn name_from_file(file_name: &str) -> Option<String> {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => file_name,
    };
    let key = match stem.rsplit_once('.') {
        Some((key, tag)) if is_content_tag(tag) => key,
        _ => stem,
    };
    display_name(key)
}

fn is_content_tag(s: &str) -> bool {
    s.len() == CONTENT_TAG_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Title-case: a letter is upper-cased when the previous character is not a
/// letter, and lower-cased otherwise.
///
/// Only one-to-one case mappings are applied. A letter whose mapping expands
/// (`ß` → `SS`, `ﬁ` → `FI`) is kept as is, so the result normalizes to itself
/// and a name read back from its storage key is the name that was enrolled.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            let mapped = if prev_alpha {
                single(c.to_lowercase())
            } else {
                single(c.to_uppercase())
            };
            out.push(mapped.unwrap_or(c));
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

fn single(mut mapping: impl Iterator<Item = char>) -> Option<char> {
    match (mapping.next(), mapping.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}
