//! Tracker policy
//!
//! Read-only settings fixed when the [`Tracker`](crate::Tracker) is built.
//! Three sources produce a [`Policy`]:
//!
//! - JSON, through serde ([`Policy::from_json`])
//! - the `KEY = value` configuration file format ([`Policy::from_config_text`])
//! - `CLINT_*` environment variables ([`Policy::from_env`])
//!
//! Every source ends in [`Policy::normalized`], which applies the implied
//! settings (checking threads needs tracking, and so on).

use std::path::Path;

use clint_unsafe_primitives::Protection;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// How mapped buffers are checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Hand out the driver's pointer
    #[default]
    Disabled,
    /// Private heap copy, no page protection
    ShadowCopy,
    /// Page-protected copy, no guard pages
    InPlaceProtect,
    /// Page-protected copy with guard pages on both sides
    GuardBefore,
    /// Page-protected copy ending at a guard page
    GuardAfter,
}

impl MappingMode {
    /// Parse a `CHECK_MAPPING` value. Absent or `malloc` selects the plain
    /// copy, unrecognized values select the after-guard layout.
    pub fn from_setting(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim) else {
            return MappingMode::ShadowCopy;
        };
        if value.eq_ignore_ascii_case("malloc") {
            MappingMode::ShadowCopy
        } else if value.eq_ignore_ascii_case("protect") {
            MappingMode::InPlaceProtect
        } else if value.eq_ignore_ascii_case("guard_before") {
            MappingMode::GuardBefore
        } else {
            MappingMode::GuardAfter
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self != MappingMode::Disabled
    }

    /// Whether the shadow lives in its own protected pages.
    pub fn uses_pages(&self) -> bool {
        matches!(
            self,
            MappingMode::InPlaceProtect | MappingMode::GuardBefore | MappingMode::GuardAfter
        )
    }

    /// Guard layout for page-based modes.
    pub fn guards(&self) -> Protection {
        match self {
            MappingMode::GuardBefore => Protection::GUARD_BEFORE | Protection::GUARD_AFTER,
            MappingMode::GuardAfter => Protection::GUARD_AFTER,
            _ => Protection::empty(),
        }
    }
}

/// Tracker settings.
///
/// Fields hold what the configuration said. The accessor methods report
/// the effective setting: all of them are off while `enabled` is off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Master switch
    pub enabled: bool,
    /// Track every object handle
    pub track: bool,
    /// Keep released records to diagnose double frees
    pub zombies: bool,
    /// Report leaked objects at shutdown
    pub leaks: bool,
    /// Capture a stack trace for each new object
    pub stack_logging: bool,
    /// Per-kernel argument update checks
    pub check_thread: bool,
    /// No two entry points may run at once
    pub strict_thread: bool,
    /// Mapped buffer checking
    pub check_mapping: MappingMode,
    /// Turn on every check
    pub check_all: bool,
    /// Abort the process after reporting a usage violation
    pub abort_on_error: bool,
    /// Diagnostic destination: `stdout`/`-`/`1`, `stderr`/`2` (the default),
    /// `tracing` or a file path
    pub log_file: Option<String>,
}

const KEY_PREFIX: &str = "CLINT_";

/// Keys with a boolean value.
const FLAG_KEYS: &[&str] = &[
    "ENABLED",
    "ABORT",
    "TRACK",
    "ZOMBIES",
    "LEAKS",
    "STACK_LOGGING",
    "CHECK_THREAD",
    "STRICT_THREAD",
    "CHECK_ALL",
];

const CHECK_MAPPING: &str = "CHECK_MAPPING";
const LOG_FILE: &str = "LOG_FILE";
const CONFIG_FILE: &str = "CONFIG_FILE";

impl Policy {
    /// Everything off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Every check on, the way a debugging session usually wants it.
    pub fn check_all() -> Self {
        Self {
            track: true,
            leaks: true,
            stack_logging: true,
            check_all: true,
            ..Self::default()
        }
        .normalized()
    }

    /// Parse a JSON policy.
    pub fn from_json(text: &str) -> Result<Self, PolicyError> {
        let policy: Policy = serde_json::from_str(text)?;
        Ok(policy.normalized())
    }

    /// Serialize the policy as JSON.
    pub fn to_json(&self) -> Result<String, PolicyError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse the `KEY = value` configuration file format.
    ///
    /// Keys are case insensitive and may omit the `CLINT_` prefix. String
    /// settings (`LOG_FILE`, and the optional value of `CHECK_MAPPING`)
    /// are double-quoted with backslash escapes. Unknown keys are ignored.
    pub fn from_config_text(text: &str) -> Result<Self, PolicyError> {
        let mut policy = Policy::default();
        policy.apply_config_text(text)?;
        Ok(policy.normalized())
    }

    /// Read and parse a configuration file.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_config_text(&text)
    }

    /// Build a policy from `CLINT_*` variables supplied by `lookup`.
    ///
    /// `CLINT_CONFIG_FILE` names a file that is read first; variables
    /// override what it sets.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, PolicyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Policy::default();
        if let Some(path) = lookup(&format!("{KEY_PREFIX}{CONFIG_FILE}")) {
            match std::fs::read_to_string(&path) {
                Ok(text) => policy.apply_config_text(&text)?,
                Err(err) => {
                    tracing::debug!(path = %path, error = %err, "configuration file not readable");
                }
            }
        }

        for key in FLAG_KEYS {
            if let Some(value) = lookup(&format!("{KEY_PREFIX}{key}")) {
                policy.set_flag(key, parse_flag(&value));
            }
        }
        if let Some(value) = lookup(&format!("{KEY_PREFIX}{CHECK_MAPPING}")) {
            policy.check_mapping = MappingMode::from_setting(Some(&value));
        }
        if let Some(value) = lookup(&format!("{KEY_PREFIX}{LOG_FILE}")) {
            policy.log_file = Some(value);
        }
        Ok(policy.normalized())
    }

    /// Build a policy from the process environment.
    pub fn from_env() -> Result<Self, PolicyError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Apply the implied settings.
    pub fn normalized(mut self) -> Self {
        let any_set = self.track
            || self.zombies
            || self.leaks
            || self.stack_logging
            || self.check_thread
            || self.strict_thread
            || self.check_mapping.is_enabled()
            || self.check_all
            || self.abort_on_error;
        if any_set {
            self.enabled = true;
        }
        if self.strict_thread {
            self.check_thread = true;
        }
        if self.check_all {
            self.check_thread = true;
            if !self.check_mapping.is_enabled() {
                self.check_mapping = MappingMode::ShadowCopy;
            }
        }
        if self.check_thread || self.check_mapping.is_enabled() {
            self.track = true;
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_tracking(&self) -> bool {
        self.enabled && self.track
    }

    pub fn keeps_zombies(&self) -> bool {
        self.enabled && self.zombies
    }

    pub fn reports_leaks(&self) -> bool {
        self.enabled && self.leaks
    }

    pub fn logs_stacks(&self) -> bool {
        self.enabled && self.stack_logging
    }

    pub fn checks_threads(&self) -> bool {
        self.enabled && self.check_thread
    }

    pub fn strict_threads(&self) -> bool {
        self.enabled && self.strict_thread
    }

    pub fn aborts_on_error(&self) -> bool {
        self.enabled && self.abort_on_error
    }

    pub fn mapping(&self) -> MappingMode {
        if self.enabled {
            self.check_mapping
        } else {
            MappingMode::Disabled
        }
    }

    /// One line per active setting, for the startup banner.
    pub fn describe(&self) -> Vec<&'static str> {
        if !self.enabled {
            return Vec::new();
        }
        let mut lines = vec!["CLINT_ENABLED enabled."];
        let flags = [
            (self.abort_on_error, "CLINT_ABORT enabled: break on OpenCL errors."),
            (self.track, "CLINT_TRACK enabled: track all OpenCL objects."),
            (self.zombies, "CLINT_ZOMBIES enabled: remember released objects."),
            (self.leaks, "CLINT_LEAKS enabled: report any leaked objects."),
            (
                self.stack_logging,
                "CLINT_STACK_LOGGING enabled: log stack during object allocation.",
            ),
            (
                self.check_thread,
                "CLINT_CHECK_THREAD enabled: check for illegal concurrent calls.",
            ),
            (
                self.strict_thread,
                "CLINT_STRICT_THREAD enabled: check for any concurrent calls.",
            ),
            (
                self.check_mapping.is_enabled(),
                "CLINT_CHECK_MAPPING enabled: allocate intermediate memory when mapping images or buffers.",
            ),
            (self.check_all, "CLINT_CHECK_ALL enabled: full OpenCL checking."),
        ];
        lines.extend(flags.iter().filter(|(on, _)| *on).map(|(_, line)| *line));
        lines
    }

    fn apply_config_text(&mut self, text: &str) -> Result<(), PolicyError> {
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = normalize_key(key);

            match key.as_str() {
                CONFIG_FILE => {}
                LOG_FILE => {
                    let path = parse_quoted(value).ok_or_else(|| PolicyError::ExpectedString {
                        line: index + 1,
                        key: key.clone(),
                    })?;
                    self.log_file = Some(path);
                }
                CHECK_MAPPING => {
                    // A bare value turns checking on with the default layout
                    let mode = parse_quoted(value);
                    self.check_mapping = MappingMode::from_setting(mode.as_deref());
                }
                flag if FLAG_KEYS.contains(&flag) => self.set_flag(flag, parse_flag(value)),
                other => {
                    tracing::debug!(key = other, line = index + 1, "ignoring configuration key");
                }
            }
        }
        Ok(())
    }

    fn set_flag(&mut self, key: &str, on: bool) {
        match key {
            "ENABLED" => self.enabled = on,
            "ABORT" => self.abort_on_error = on,
            "TRACK" => self.track = on,
            "ZOMBIES" => self.zombies = on,
            "LEAKS" => self.leaks = on,
            "STACK_LOGGING" => self.stack_logging = on,
            "CHECK_THREAD" => self.check_thread = on,
            "STRICT_THREAD" => self.strict_thread = on,
            "CHECK_ALL" => self.check_all = on,
            _ => {}
        }
    }
}

/// Upper-case a key and strip an optional `CLINT_` prefix.
fn normalize_key(key: &str) -> String {
    let upper = key.trim().to_ascii_uppercase();
    match upper.strip_prefix(KEY_PREFIX) {
        Some(rest) => rest.to_string(),
        None => upper,
    }
}

/// Flag value: `true`/`yes`/`on` and `false`/`no`/`off` (any case), a
/// leading integer (non-zero is on), anything else is on.
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    for word in ["true", "yes", "on"] {
        if value.eq_ignore_ascii_case(word) {
            return true;
        }
    }
    for word in ["false", "no", "off"] {
        if value.eq_ignore_ascii_case(word) {
            return false;
        }
    }
    match leading_integer(value) {
        Some(n) => n != 0,
        None => true,
    }
}

/// Parse the integer prefix of `s` (decimal, or hex with `0x`).
fn leading_integer(s: &str) -> Option<i64> {
    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = match body.get(..2) {
        Some(p) if p.eq_ignore_ascii_case("0x") => (16, &body[2..]),
        _ => (10, body),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map_or(digits.len(), |(i, _)| i);
    if end == 0 {
        // "0x" with no hex digits still parsed the leading zero
        return (radix == 16).then_some(0);
    }
    let magnitude = i64::from_str_radix(&digits[..end], radix).unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

/// Parse a double-quoted string with backslash escapes.
fn parse_quoted(value: &str) -> Option<String> {
    let mut chars = value.trim_start().chars();
    if chars.next() != Some('"') {
        return None;
    }
    let mut out = String::new();
    loop {
        match chars.next()? {
            '"' => return Some(out),
            '\\' => out.push(chars.next()?),
            c => out.push(c),
        }
    }
}
