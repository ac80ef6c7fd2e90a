use std::env;
use std::sync::OnceLock;

static FLOWSCOPE_EAGER: OnceLock<Option<bool>> = OnceLock::new();
static FLOWSCOPE_MACHINE_NUM: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_count(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

/// `FLOWSCOPE_EAGER`, when set, forces eager execution on or off for new sessions.
pub(crate) fn eager_override() -> Option<bool> {
    *FLOWSCOPE_EAGER.get_or_init(|| match env::var("FLOWSCOPE_EAGER") {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    })
}

/// `FLOWSCOPE_MACHINE_NUM`, when set to a positive integer, overrides the configured node count.
pub(crate) fn machine_num_override() -> Option<usize> {
    *FLOWSCOPE_MACHINE_NUM.get_or_init(|| match env::var("FLOWSCOPE_MACHINE_NUM") {
        Ok(value) => parse_count(&value),
        Err(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_and_count_parsing() {
        for yes in ["1", "true", " YES ", "On"] {
            assert!(parse_bool(yes), "{yes}");
        }
        for no in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(no), "{no}");
        }
        assert_eq!(parse_count("4"), Some(4));
        assert_eq!(parse_count("0"), None);
        assert_eq!(parse_count("four"), None);
    }
}
