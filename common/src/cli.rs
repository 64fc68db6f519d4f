//! Shared CLI policy.
//!
//! Console color selection, honouring the conventions most Rust tools
//! follow: an explicit command-line choice wins, `NO_COLOR` and `EMACS`
//! disable colors, and `auto` otherwise colors only real terminals.

use std::env;
use std::str::FromStr;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => {
                if env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some() {
                    return false;
                }
                atty::is(stream)
            }
        }
    }

    /// Convenience helper for stderr, where log output lands.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

impl FromStr for ColorWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "auto" => Ok(ColorWhen::Auto),
            "always" => Ok(ColorWhen::Always),
            "never" => Ok(ColorWhen::Never),
            other => Err(format!(
                "invalid color choice '{other}' (expected auto, always or never)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn with_env_var<F: FnOnce()>(key: &str, val: &str, f: F) {
        // ---
        let prev = env::var_os(key);
        env::set_var(key, val);
        f();
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn no_color_disables_in_auto() {
        // ---
        with_env_var("NO_COLOR", "1", || {
            assert!(!ColorWhen::Auto.should_color_stderr());
        });
    }

    #[test]
    fn explicit_choice_wins_over_env() {
        // ---
        with_env_var("NO_COLOR", "1", || {
            assert!(ColorWhen::Always.should_color_stderr());
        });
        assert!(!ColorWhen::Never.should_color_stderr());
    }

    #[test]
    fn parses_command_line_values() {
        // ---
        assert_eq!("auto".parse(), Ok(ColorWhen::Auto));
        assert_eq!("always".parse(), Ok(ColorWhen::Always));
        assert_eq!("never".parse(), Ok(ColorWhen::Never));
        assert!("sometimes".parse::<ColorWhen>().is_err());
    }
}
