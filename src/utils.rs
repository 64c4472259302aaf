use colored::{ColoredString, Colorize};

/// Helper to format a boolean as "Enabled" or "Disabled"
pub fn enabled(flag: bool) -> ColoredString {
    if flag {
        "Enabled".green()
    } else {
        "Disabled".red()
    }
}

/// Timezone advertised on web completion requests
pub const TIME_ZONE: &str = "America/New_York";

/// Lowercase hex rendering of a digest
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
