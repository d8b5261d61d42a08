use uuid::Uuid;

pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// A stem is the UUID prefix shared by all files of one workflow instance.
/// Anything that reaches the lock table or a vault path must validate first
/// so a hostile filename cannot escape the vault.
pub fn validate_stem(raw: &str) -> Result<(), String> {
    if raw.is_empty() {
        return Err("stem must be non-empty".to_string());
    }
    if raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err("stem must use only ASCII letters, digits, '-' or '_'".to_string())
}

pub fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Splits `<stem><suffix>` where suffix is one of the vault file suffixes.
pub fn split_stem_suffix(filename: &str) -> Option<(&str, &str)> {
    for suffix in [".action.yaml", ".plan.md", ".approval.md"] {
        if let Some(stem) = filename.strip_suffix(suffix) {
            if !stem.is_empty() {
                return Some((stem, suffix));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_unique_and_well_formed() {
        let a = new_uuid();
        let b = new_uuid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert!(validate_stem(&a).is_ok());
    }

    #[test]
    fn stem_validation_rejects_path_escapes() {
        assert!(validate_stem("../etc/passwd").is_err());
        assert!(validate_stem("").is_err());
        assert!(validate_stem("a1b2-c3_d4").is_ok());
    }

    #[test]
    fn split_recognizes_vault_suffixes() {
        assert_eq!(
            split_stem_suffix("abc.action.yaml"),
            Some(("abc", ".action.yaml"))
        );
        assert_eq!(split_stem_suffix("abc.plan.md"), Some(("abc", ".plan.md")));
        assert_eq!(split_stem_suffix("notes.txt"), None);
        assert_eq!(split_stem_suffix(".plan.md"), None);
    }
}
