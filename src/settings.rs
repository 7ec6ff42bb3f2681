use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_THEME: &str = "theme-dark";
pub const THEMES: [&str; 3] = ["theme-gruvbox", "theme-light", "theme-dark"];

const PROPERTIES_HEADER: &str = "#daily-plan configuration";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    Theme,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Theme => "theme",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Self::Theme => DEFAULT_THEME,
        }
    }
}

/// Accepts `dark` as well as `theme-dark`.
pub fn normalize_theme(name: &str) -> Option<String> {
    let name = name.trim().to_ascii_lowercase();
    let full = if name.starts_with("theme-") {
        name
    } else {
        format!("theme-{name}")
    };
    THEMES.contains(&full.as_str()).then_some(full)
}

/// Parses the `key=value` settings file. Comment lines start with `#` or `!`.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) = match line.split_once(['=', ':']) {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        map.insert(key.to_string(), value.to_string());
    }
    map
}

pub fn encode_properties(map: &BTreeMap<String, String>) -> String {
    let mut out = String::from(PROPERTIES_HEADER);
    out.push('\n');
    for (key, value) in map {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}
