//! Ordered flag sets for compiler and linker command lines.
//!
//! Flag order is behaviorally observable: later flags override earlier ones
//! on most compiler command lines, so a config preserves insertion order and
//! serialization appends a default config's flags only where absent.

use crate::smallmap::SmallMap;

/// An insertion-ordered `flag -> value` map.  A flag is either a bare token
/// ("-g", "crs") or a "key=value" pair ("-std=c++17" is key "-std" with
/// value "c++17").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    flags: SmallMap<String, String>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Parse and record one flag.  A single '=' splits key from value; a
    /// flag with more than one '=' is kept whole as a bare key.
    pub fn set_flag(&mut self, flag: &str) -> &mut Config {
        let mut parts = flag.splitn(3, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next();
        if parts.next().is_some() {
            self.flags.insert(flag.to_string(), String::new());
        } else {
            self.flags
                .insert(key.to_string(), value.unwrap_or("").to_string());
        }
        self
    }

    pub fn set_flags<I, S>(&mut self, flags: I) -> &mut Config
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for flag in flags {
            self.set_flag(flag.as_ref());
        }
        self
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn get_flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Adopt flags from `other`.  Missing keys are appended; existing keys
    /// are overridden only when `prior_other`.
    pub fn merge(&mut self, other: &Config, prior_other: bool) {
        for (k, v) in other.flags.iter() {
            if self.flags.contains_key(k) && !prior_other {
                continue;
            }
            self.flags.insert(k.clone(), v.clone());
        }
    }

    /// Render to a space-separated string in insertion order, then append
    /// any of `default`'s flags not already present.
    pub fn to_string_with(&self, default: Option<&Config>) -> String {
        let mut out = String::new();
        let mut emit = |k: &str, v: &str| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(k);
            if !v.is_empty() {
                out.push('=');
                out.push_str(v);
            }
        };
        for (k, v) in self.flags.iter() {
            emit(k, v);
        }
        if let Some(default) = default {
            for (k, v) in default.flags.iter() {
                if !self.has_flag(k) {
                    emit(k, v);
                }
            }
        }
        out
    }
}
