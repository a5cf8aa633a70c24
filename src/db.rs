//! On-disk records of previous builds: per-artifact command files and the
//! library export table other projects import.

use anyhow::Context;
use std::path::Path;

/// The file `<artifact>.cmd` stores the exact command last used to produce
/// the artifact; a mismatch with the freshly composed command forces a
/// rebuild.
pub fn cmd_path(artifact: &str) -> String {
    format!("{}.cmd", artifact)
}

pub fn read_cmd(artifact: &str) -> String {
    std::fs::read_to_string(cmd_path(artifact)).unwrap_or_default()
}

pub fn write_cmd(artifact: &str, cmd: &str) -> anyhow::Result<()> {
    let path = cmd_path(artifact);
    if let Some(parent) = Path::new(&path).parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(&path, cmd).with_context(|| format!("write {}", path))
}

/// One row of a `BUILD.libs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LibRow {
    pub name: String,
    pub inc_dirs: Vec<String>,
    pub file: String,
    /// Dependency library names; only present for this project's own rows.
    pub deps: Option<Vec<String>>,
}

fn join(parts: &[String]) -> String {
    parts.join(";")
}

fn split(s: &str) -> Vec<String> {
    s.split(';')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// Serialize the export table: this project's libraries first, then any
/// external libraries they pull in transitively.
pub fn render_libs_table(own: &[LibRow], imported: &[LibRow]) -> String {
    let mut out = String::new();
    out.push_str("#format: lib_name \t lib_include_dirs \t [lib_file \t [deps]]\n");
    out.push_str("#using ';' as the separator for lib_include_dirs and deps\n");
    for row in own {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            row.name,
            join(&row.inc_dirs),
            row.file,
            join(row.deps.as_deref().unwrap_or(&[]))
        ));
    }
    for row in imported {
        out.push_str(&format!(
            "{}\t{}\t{}\n",
            row.name,
            join(&row.inc_dirs),
            row.file
        ));
    }
    out
}

/// Parse a `BUILD.libs` table, returning the parseable rows and the lines
/// that were not (for the caller to warn about).
pub fn parse_libs_table(text: &str) -> (Vec<LibRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut invalid = Vec::new();
    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 3 && cols.len() != 4 {
            invalid.push(line.to_string());
            continue;
        }
        rows.push(LibRow {
            name: cols[0].to_string(),
            inc_dirs: split(cols[1]),
            file: cols[2].to_string(),
            deps: cols.get(3).map(|deps| split(deps)),
        });
    }
    (rows, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libs_table_round_trip() {
        let own = vec![
            LibRow {
                name: "/core/net".to_string(),
                inc_dirs: vec!["/prj/core".to_string()],
                file: "/prj/.zmade/core/libnet.a".to_string(),
                deps: Some(vec!["/util/str".to_string(), "@boost/".to_string()]),
            },
            LibRow {
                name: "/util/str".to_string(),
                inc_dirs: vec!["/prj/util".to_string()],
                file: "/prj/.zmade/util/libstr.a".to_string(),
                deps: Some(vec![]),
            },
        ];
        let imported = vec![LibRow {
            name: "@boost/boost_regex".to_string(),
            inc_dirs: vec!["/opt/boost/include".to_string()],
            file: "/opt/boost/lib/libboost_regex.a".to_string(),
            deps: None,
        }];
        let text = render_libs_table(&own, &imported);
        let (rows, invalid) = parse_libs_table(&text);
        assert!(invalid.is_empty());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "/core/net");
        assert_eq!(
            rows[0].deps.as_deref().unwrap(),
            ["/util/str".to_string(), "@boost/".to_string()]
        );
        assert_eq!(rows[2].name, "@boost/boost_regex");
        assert_eq!(rows[2].deps, None);
    }

    #[test]
    fn invalid_lines_are_reported_not_fatal() {
        let (rows, invalid) = parse_libs_table("#comment\nbogus line without tabs\n");
        assert!(rows.is_empty());
        assert_eq!(invalid.len(), 1);
    }

    #[test]
    fn cmd_files_sit_next_to_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("sub/a.o");
        let artifact = artifact.to_str().unwrap();
        write_cmd(artifact, "g++ -c a.cpp").unwrap();
        assert_eq!(read_cmd(artifact), "g++ -c a.cpp");
        assert!(dir.path().join("sub/a.o.cmd").exists());
    }
}
