//! Topic name and filter validation and matching
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - `$`-prefixed filters such as `$share/g/t` are plain literals

/// Validate a topic name (used in PUBLISH and will topics)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one non-empty level
/// - # matches one or more trailing levels (the remainder must be non-empty)
/// - every other level, `$`-prefixed ones included, compares literally
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(filter_level) = filter_levels.next() {
        match filter_level {
            "#" => {
                if filter_levels.peek().is_some() {
                    return false;
                }
                return match topic_levels.next() {
                    Some(first) => !first.is_empty() || topic_levels.next().is_some(),
                    None => false,
                };
            }
            "+" => match topic_levels.next() {
                Some(level) if !level.is_empty() => {}
                _ => return false,
            },
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("$SYS/broker").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+/topic").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("$share/group/a/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("+test").is_err());
    }

    #[test_case("a/+/c", "a/b/c", true ; "plus matches one level")]
    #[test_case("a/#", "a/b/c", true ; "hash matches trailing levels")]
    #[test_case("a/+", "a/b/c", false ; "plus does not span levels")]
    #[test_case("$share/g/a", "a", false ; "dollar prefix is literal")]
    #[test_case("$share/g/a", "$share/g/a", true ; "dollar prefix matches itself")]
    #[test_case("a/#", "a", false ; "hash needs at least one level")]
    #[test_case("a/#", "a/", false ; "hash needs a non-empty remainder")]
    #[test_case("#", "anything/at/all", true ; "bare hash")]
    #[test_case("+", "a", true ; "bare plus")]
    #[test_case("a/+", "a/", false ; "plus needs a non-empty level")]
    #[test_case("a/b", "a/b", true ; "exact")]
    #[test_case("a/b", "a/b/c", false ; "filter shorter than topic")]
    #[test_case("a/b/c", "a/b", false ; "filter longer than topic")]
    #[test_case("+/+", "/b", false ; "leading empty level is not a plus match")]
    #[test_case("a/#/c", "a/b/c", false ; "hash not last")]
    fn test_topic_matches(filter: &str, topic: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }
}
