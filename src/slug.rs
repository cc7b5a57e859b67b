//! URL slugs.

/// Lowercase, dash-separated, `[a-z0-9-]` only. Applying it twice changes
/// nothing.
pub fn slugify(value: &str) -> String {
    slug::slugify(value)
}

/// Whether `slug` is reserved by the system and can't name a post, tag or
/// user.
pub fn is_protected(slug: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| p.eq_ignore_ascii_case(slug))
}

/// Slugify `value` and reject empty or reserved results.
pub fn validate(value: &str, protected: &[String]) -> Option<String> {
    let slug = slugify(value);
    if slug.is_empty() || is_protected(&slug, protected) {
        None
    } else {
        Some(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !s.starts_with('-')
            && !s.ends_with('-')
            && !s.contains("--")
    }

    #[test]
    fn slugify_normalizes_titles() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("  Rust & PHP: a love story!  "), "rust-php-a-love-story");
        assert_eq!(slugify("Ünïcödé Tëxt"), "unicode-text");
    }

    #[test]
    fn slugify_is_idempotent_and_well_formed() {
        let inputs = [
            "Hello World",
            "--leading and trailing--",
            "multiple   spaces___and---dashes",
            "Ça va? Très bien!",
            "already-a-slug",
            "123 numbers 456",
            "",
        ];
        for input in inputs {
            let once = slugify(input);
            assert_eq!(slugify(&once), once, "not idempotent for {:?}", input);
            assert!(well_formed(&once), "malformed slug {:?} for {:?}", once, input);
        }
    }

    #[test]
    fn protected_slugs_are_rejected() {
        let protected = vec!["api".to_string(), "tag".to_string()];
        assert!(validate("API", &protected).is_none());
        assert!(validate("tag", &protected).is_none());
        assert!(validate("!!!", &protected).is_none());
        assert_eq!(validate("My Tag", &protected).as_deref(), Some("my-tag"));
    }
}
