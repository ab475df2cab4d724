//! Device id allow-list.

use regex::Regex;

/// Alphanumeric plus `-._:`, ending in an alphanumeric character or hyphen.
pub const DEFAULT_DEVICE_ID_PATTERN: &str = r"^[a-zA-Z0-9\-._:]*[a-zA-Z0-9\-]+$";

/// Lowercase alphanumeric plus hyphen.
pub const STRICT_DEVICE_ID_PATTERN: &str = r"^[a-z0-9\-]+$";

/// A compiled device id pattern.
#[derive(Debug, Clone)]
pub struct DeviceIdPattern {
    regex: Regex,
}

impl DeviceIdPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn is_valid(&self, device_id: &str) -> bool {
        !device_id.is_empty() && self.regex.is_match(device_id)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl Default for DeviceIdPattern {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_DEVICE_ID_PATTERN).expect("default pattern compiles"),
        }
    }
}
