use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const MAX_SECTIONS: usize = 100;
const MAX_ENTRIES_PER_SECTION: usize = 100;

pub type ConfigValue = String;
pub type ConfigSection = HashMap<String, ConfigValue>;

#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: HashMap<String, ConfigSection>,
}

impl Config {
    pub fn new() -> Self {
        Self { sections: HashMap::new() }
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section.is_empty() || key.is_empty() {
            return Err(anyhow::anyhow!("Section or key cannot be empty"));
        }

        if self.sections.len() >= MAX_SECTIONS {
            return Err(anyhow::anyhow!("Maximum number of sections ({}) reached", MAX_SECTIONS));
        }

        let section_map = self.sections.entry(section.to_string()).or_default();
        if section_map.len() >= MAX_ENTRIES_PER_SECTION {
            return Err(anyhow::anyhow!(
                "Maximum entries per section ({}) reached for section '{}'",
                MAX_ENTRIES_PER_SECTION,
                section
            ));
        }

        debug!("Setting config: [{}] {} = {}", section, key, value);
        section_map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|section_map| section_map.get(key))
            .map(|v| v.as_str())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.get_value(section, key) {
            Some(val) => match val.parse::<i64>() {
                Ok(num) => num,
                Err(_) => {
                    warn!(
                        "Invalid integer value '{}' for {}.{}, using default {}",
                        val, section, key, default
                    );
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_value(section, key) {
            Some(val) => {
                let lower_val = val.to_lowercase();
                match lower_val.as_str() {
                    "1" | "true" | "yes" | "on" | "enabled" => true,
                    "0" | "false" | "no" | "off" | "disabled" => false,
                    _ => {
                        warn!(
                            "Invalid boolean value '{}' for {}.{}, using default {}",
                            val, section, key, default
                        );
                        default
                    }
                }
            }
            None => default,
        }
    }

    pub fn is_section_exists(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }
}

pub struct ConfigLoader {
    path: String,
}

impl ConfigLoader {
    pub fn new(path: String) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<Config> {
        let filepath = self.path.trim();

        let config_path = Path::new(filepath);
        if !config_path.exists() {
            return Err(anyhow::anyhow!("Config file does not exist: {}", filepath));
        }
        if !config_path.is_file() {
            return Err(anyhow::anyhow!("Config path is not a regular file: {}", filepath));
        }

        let contents = fs::read_to_string(config_path)?;
        Ok(Self::parse_config(&contents))
    }

    pub fn parse_config(contents: &str) -> Config {
        let mut config = Config::new();
        let mut current_section = String::new();

        for (idx, line) in contents.lines().enumerate() {
            let line_number = idx + 1;
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // Section header: [section]
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                let section = &trimmed[1..trimmed.len() - 1];
                current_section = section.trim().to_string();
                if current_section.is_empty() {
                    warn!("Empty section name at line {}", line_number);
                }
                continue;
            }

            if let Some(equals_pos) = trimmed.find('=') {
                let key = trimmed[..equals_pos].trim();
                let value = Self::unquote_value(trimmed[equals_pos + 1..].trim());

                if key.is_empty() {
                    warn!("Empty key at line {}", line_number);
                    continue;
                }
                if current_section.is_empty() {
                    warn!("Key-value pair '{}' outside of section at line {}", key, line_number);
                    continue;
                }

                if let Err(e) = config.set_value(&current_section, key, value) {
                    warn!("Failed to set config value at line {}: {}", line_number, e);
                }
            } else {
                warn!("Invalid config line (no '=' found) at line {}: {}", line_number, trimmed);
            }
        }

        config
    }

    fn unquote_value(value: &str) -> &str {
        let trimmed = value.trim();

        if trimmed.len() >= 2 {
            let first = trimmed.chars().next().unwrap();
            let last = trimmed.chars().last().unwrap();
            if (first == '"' && last == '"') || (first == '\'' && last == '\'') {
                return &trimmed[1..trimmed.len() - 1];
            }
        }

        trimmed
    }
}
