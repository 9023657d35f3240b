//! Serial number formatting and keepout-zone arithmetic.
//!
//! `current_counter` is the only value here the server owns; everything else
//! shapes how a number is printed. Allocation itself is an atomic backend
//! operation (see [`crate::VaultBackend::allocate_serial`]) that uses
//! [`next_available`] inside its transactional unit.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// A reserved numeric range, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepoutZone {
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub description: String,
}

impl KeepoutZone {
    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }
}

/// Per-organization serialization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub letter_prefix: String,
    #[serde(default = "default_padding")]
    pub padding_digits: usize,
    #[serde(default)]
    pub current_counter: u64,
    #[serde(default)]
    pub keepout_zones: Vec<KeepoutZone>,
    #[serde(default)]
    pub tab_enabled: bool,
    #[serde(default = "default_tab_separator")]
    pub tab_separator: String,
    #[serde(default = "default_tab_padding")]
    pub tab_padding_digits: usize,
    #[serde(default)]
    pub tab_required: bool,
    /// Lower-case extensions including the dot, e.g. `.sldprt`
    #[serde(default)]
    pub auto_apply_extensions: Vec<String>,
}

fn default_padding() -> usize {
    5
}

fn default_tab_separator() -> String {
    "-".to_string()
}

fn default_tab_padding() -> usize {
    3
}

impl Default for SerializationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: String::new(),
            suffix: String::new(),
            letter_prefix: String::new(),
            padding_digits: default_padding(),
            current_counter: 0,
            keepout_zones: Vec::new(),
            tab_enabled: false,
            tab_separator: default_tab_separator(),
            tab_padding_digits: default_tab_padding(),
            tab_required: false,
            auto_apply_extensions: Vec::new(),
        }
    }
}

impl SerializationSettings {
    /// Format a base number with prefix, letter prefix, padding and suffix.
    pub fn format_base(&self, value: u64) -> String {
        format!(
            "{}{}{:0width$}{}",
            self.prefix,
            self.letter_prefix,
            value,
            self.suffix,
            width = self.padding_digits
        )
    }

    /// Format a full identifier, appending the tab sub-identifier when given.
    ///
    /// The tab number is caller-supplied and independent of the counter.
    pub fn format(&self, value: u64, tab: Option<u32>) -> Result<String> {
        let base = self.format_base(value);
        match tab {
            Some(n) if self.tab_enabled => Ok(format!(
                "{}{}{:0width$}",
                base,
                self.tab_separator,
                n,
                width = self.tab_padding_digits
            )),
            Some(_) => Err(VaultError::InvalidArgument(
                "Tab numbers are not enabled for this organization".to_string(),
            )),
            None if self.tab_enabled && self.tab_required => Err(VaultError::InvalidArgument(
                "A tab number is required".to_string(),
            )),
            None => Ok(base),
        }
    }

    /// Whether serial numbers are applied automatically to `file_name`.
    pub fn applies_to(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.auto_apply_extensions.iter().any(|ext| {
            let ext = ext.to_ascii_lowercase();
            let ext = if ext.starts_with('.') { ext } else { format!(".{}", ext) };
            lower.ends_with(&ext)
        })
    }

    /// Reject settings that can never produce a number.
    pub fn validate(&self) -> Result<()> {
        for zone in &self.keepout_zones {
            if zone.start > zone.end {
                return Err(VaultError::InvalidArgument(format!(
                    "Keepout zone {}-{} is inverted",
                    zone.start, zone.end
                )));
            }
        }
        if self.padding_digits > 20 || self.tab_padding_digits > 20 {
            return Err(VaultError::InvalidArgument(
                "Padding wider than 20 digits".to_string(),
            ));
        }
        Ok(())
    }
}

/// The next number after `counter` that lies outside every keepout zone.
///
/// Landing past one zone can put the candidate inside another, so the check
/// repeats until no zone contains it.
pub fn next_available(counter: u64, zones: &[KeepoutZone]) -> Result<u64> {
    let overflow = || VaultError::InvalidArgument("Serial counter exhausted".to_string());
    let mut candidate = counter.checked_add(1).ok_or_else(overflow)?;
    // Each zone can push the candidate at most once since it only grows.
    for _ in 0..=zones.len() {
        match zones.iter().find(|zone| zone.contains(candidate)) {
            Some(zone) => candidate = zone.end.checked_add(1).ok_or_else(overflow)?,
            None => return Ok(candidate),
        }
    }
    Ok(candidate)
}

/// Highest base number among `names` that matches this format.
///
/// Advisory only: an administrator decides whether to apply it.
pub fn detect_highest<'a, I>(settings: &SerializationSettings, names: I) -> Result<Option<u64>>
where
    I: IntoIterator<Item = &'a str>,
{
    // Same layout as `format`: base, suffix, then the optional tab
    let pattern = format!(
        "^{}{}(\\d+){}(?:{}\\d+)?$",
        regex::escape(&settings.prefix),
        regex::escape(&settings.letter_prefix),
        regex::escape(&settings.suffix),
        regex::escape(&settings.tab_separator),
    );
    let re = Regex::new(&pattern)
        .map_err(|e| VaultError::Internal(format!("Failed to build serial pattern: {}", e)))?;

    let highest = names
        .into_iter()
        .map(strip_extension)
        .filter_map(|name| re.captures(name))
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()))
        .max();
    Ok(highest)
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}
