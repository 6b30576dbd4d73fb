//! Engine configuration.

/// Process-level settings for a [`Trail`](crate::Trail).
#[derive(Debug, Clone)]
pub struct TrailConfig {
    /// Global recording switch; can be flipped later with `Trail::set_enabled`.
    pub enabled: bool,
    /// Bookkeeping attributes never recorded for any item type.
    pub skipped_attributes: Vec<String>,
    /// Attribute holding a record's identity; removed by `ReifyOptions::unset_id`.
    pub identity_attribute: String,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skipped_attributes: Vec::new(),
            identity_attribute: "id".to_string(),
        }
    }
}

impl TrailConfig {
    /// Defaults overridden by `TRAIL_ENABLED` and `TRAIL_SKIPPED_ATTRIBUTES`
    /// (comma separated).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("TRAIL_ENABLED") {
            config.enabled = match parse_flag(&v) {
                Some(enabled) => enabled,
                None => {
                    tracing::warn!(value = %v, "unrecognised TRAIL_ENABLED; recording stays on");
                    true
                }
            };
        }
        if let Ok(v) = std::env::var("TRAIL_SKIPPED_ATTRIBUTES") {
            config.skipped_attributes = parse_list(&v);
        }
        config
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_lists_parse_leniently() {
        assert_eq!(parse_flag(" Off "), Some(false));
        assert_eq!(parse_flag("yes"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(
            parse_list("lock_version, ,updated_by"),
            vec!["lock_version".to_string(), "updated_by".to_string()]
        );
    }

    #[test]
    fn unrecognised_enabled_flag_keeps_recording_on() {
        std::env::set_var("TRAIL_ENABLED", "maybe");
        assert!(TrailConfig::from_env().enabled);
        std::env::set_var("TRAIL_ENABLED", "off");
        assert!(!TrailConfig::from_env().enabled);
        std::env::remove_var("TRAIL_ENABLED");
    }
}
