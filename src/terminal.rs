//! Terminal color support.

#[derive(Debug, Clone, Copy)]
pub enum Color {
    BrightYellow,
    BrightCyan,
    BrightRed,
}

impl Color {
    fn code(self) -> &'static str {
        match self {
            Color::BrightYellow => "\x1b[33;1m",
            Color::BrightCyan => "\x1b[36;1m",
            Color::BrightRed => "\x1b[31;1m",
        }
    }
}

pub fn stdout_is_tty() -> bool {
    unsafe { libc::isatty(/* stdout */ 1) == 1 }
}

pub fn stderr_is_tty() -> bool {
    unsafe { libc::isatty(/* stderr */ 2) == 1 }
}

/// Wrap `s` in ANSI color codes when `tty`.
pub fn paint(s: &str, color: Color, tty: bool) -> String {
    if !tty {
        return s.to_string();
    }
    format!("{}{}\x1b[0m", color.code(), s)
}
