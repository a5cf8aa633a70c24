//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! A `.d` file is a single make rule: `target: dep1 dep2 \` with
//! backslash-newline continuations.  We only care about the dependency list;
//! deps that no longer exist on disk (renamed headers) are still returned,
//! the rebuild logic copes with them.

use anyhow::bail;

/// Parse the dependency list out of `.d` file content.
pub fn parse(content: &str) -> anyhow::Result<Vec<String>> {
    let Some((_, deps)) = content.split_once(':') else {
        bail!("missing ':' separator in dependency file");
    };
    let unwrapped = deps.replace("\\\r\n", " ").replace("\\\n", " ");
    Ok(unwrapped
        .split_whitespace()
        .map(|dep| dep.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let deps = parse("build/browse.o: src/browse.cc src/browse.h\n").unwrap();
        assert_eq!(deps, vec!["src/browse.cc", "src/browse.h"]);
    }

    #[test]
    fn parse_space_suffix() {
        let deps = parse("build/browse.o: src/browse.cc   \n").unwrap();
        assert_eq!(deps, vec!["src/browse.cc"]);
    }

    #[test]
    fn parse_multiline() {
        let deps = parse("build/browse.o: src/browse.cc\\\n  build/browse_py.h").unwrap();
        assert_eq!(deps, vec!["src/browse.cc", "build/browse_py.h"]);
    }

    #[test]
    fn parse_crlf_continuation() {
        let deps = parse("a.o: x.cc\\\r\n y.h\r\n").unwrap();
        assert_eq!(deps, vec!["x.cc", "y.h"]);
    }

    #[test]
    fn parse_without_final_newline() {
        let deps = parse("build/browse.o: src/browse.cc").unwrap();
        assert_eq!(deps, vec!["src/browse.cc"]);
    }

    #[test]
    fn parse_empty_deps() {
        let deps = parse("out/b.o :\n").unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn parse_missing_colon() {
        assert!(parse("foo bar").is_err());
    }
}
