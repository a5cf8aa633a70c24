//! The build-target graph: typed nodes, dependency edges, and traversal.
//!
//! Nodes live in an arena and refer to each other by `FileId`, so
//! back-references (an object knows the libraries that archive it) are plain
//! indices rather than owning pointers.

use crate::config::Config;
use crate::densemap::{self, DenseMap};
use anyhow::bail;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Id for a node in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);
impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Normal,
    Header,
    Source,
    Proto,
    Obj,
    Lib,
    Binary,
}

pub const SOURCE_SUFFIXES: &[&str] = &[
    ".cpp", ".cc", ".cxx", ".CPP", ".CC", ".CXX", ".c", ".C",
];
pub const HEADER_SUFFIXES: &[&str] = &[
    ".h", ".hh", ".hpp", ".hxx", ".H", ".HH", ".HPP", ".HXX",
];

pub fn has_suffix(s: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|suf| s.ends_with(suf))
}

/// Replace the first matching suffix of `s` with `new`, or return `s` whole.
pub fn replace_suffix(s: &str, suffixes: &[&str], new: &str) -> String {
    for suf in suffixes {
        if let Some(stem) = s.strip_suffix(suf) {
            return format!("{}{}", stem, new);
        }
    }
    s.to_string()
}

/// The extension of a path including the dot (".cpp"), or "".
pub fn extension(path: &str) -> &str {
    let fname = crate::canon::file_name(path);
    match fname.rfind('.') {
        Some(p) if p > 0 => &fname[p..],
        _ => "",
    }
}

/// A rule template for producing a file: a command string with `${1}`,
/// `${2}`, ... placeholders substituted by `generate`.
#[derive(Debug, Clone, Default)]
pub struct Generator {
    rule: String,
}

impl Generator {
    pub fn new(rule: &str) -> Generator {
        Generator {
            rule: rule.to_string(),
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Substitute the placeholders in order.  Fewer inputs than placeholders
    /// is an error.
    pub fn generate(&self, inputs: &[&str]) -> anyhow::Result<String> {
        let mut out = self.rule.clone();
        for idx in 0.. {
            let placeholder = format!("${{{}}}", idx + 1);
            let Some(p) = out.find(&placeholder) else {
                break;
            };
            if idx >= inputs.len() {
                bail!(
                    "not enough inputs(size:{}) for rule({})",
                    inputs.len(),
                    self.rule
                );
            }
            out.replace_range(p..p + placeholder.len(), inputs[idx]);
        }
        Ok(out)
    }
}

/// Object-specific payload: the source it compiles and the libraries or
/// binaries that consume it (back-references used for include propagation).
#[derive(Debug, Default)]
pub struct ObjExt {
    pub src: String,
    pub inc_dirs: Vec<String>,
    pub uniq_inc_dirs: HashSet<String>,
    pub users: Vec<FileId>,
}

#[derive(Debug, Default)]
pub struct LibExt {
    pub is_static: bool,
    /// Set when users of this library must link it whole-archive.
    pub whole_archive: bool,
    /// Imported prebuilt third-party library: no command of its own.
    pub imported: bool,
    pub added_proto_runtime: bool,
    pub objs: Vec<FileId>,
    pub objs_flags: Vec<String>,
    pub libs: Vec<FileId>,
    pub whole_archive_libs: Vec<FileId>,
    /// Include directories exposed to users of this library.
    pub inc_dirs: BTreeSet<String>,
    pub link_conf: Config,
}

#[derive(Debug, Default)]
pub struct BinExt {
    pub objs: Vec<FileId>,
    pub objs_flags: Vec<String>,
    pub libs: Vec<FileId>,
    pub whole_archive_libs: Vec<FileId>,
    pub link_dirs: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ProtoExt {
    pub import_dirs: Vec<String>,
}

#[derive(Debug)]
pub enum NodeExt {
    None,
    Obj(ObjExt),
    Lib(LibExt),
    Bin(BinExt),
    Proto(ProtoExt),
}

/// One build node.  `file` is the absolute on-disk artifact path; `key` is
/// the canonical registry key.
#[derive(Debug)]
pub struct Node {
    pub key: String,
    pub file: String,
    pub name: String,
    pub kind: FileKind,
    pub compiler: String,
    pub cwd: String,
    pub config: Option<Config>,
    pub generator: Option<Generator>,
    pub deps: Vec<FileId>,
    pub uniq_deps: HashSet<FileId>,
    /// Composed command, cached after the first composition.
    pub cmd: Option<String>,
    pub build_done: bool,
    pub has_been_built: bool,
    pub forced_build: bool,
    /// The file appears as a side effect of building some dep; the node has
    /// no command of its own.
    pub generated_by_dep: bool,
    pub ext: NodeExt,
}

impl Node {
    pub fn new(key: String, kind: FileKind) -> Node {
        Node {
            key,
            file: String::new(),
            name: String::new(),
            kind,
            compiler: String::new(),
            cwd: String::new(),
            config: None,
            generator: None,
            deps: Vec::new(),
            uniq_deps: HashSet::new(),
            cmd: None,
            build_done: false,
            has_been_built: false,
            forced_build: false,
            generated_by_dep: false,
            ext: NodeExt::None,
        }
    }

    pub fn config_mut(&mut self) -> &mut Config {
        self.config.get_or_insert_with(Config::new)
    }

    pub fn as_obj(&self) -> Option<&ObjExt> {
        match &self.ext {
            NodeExt::Obj(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_obj_mut(&mut self) -> Option<&mut ObjExt> {
        match &mut self.ext {
            NodeExt::Obj(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_lib(&self) -> Option<&LibExt> {
        match &self.ext {
            NodeExt::Lib(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_lib_mut(&mut self) -> Option<&mut LibExt> {
        match &mut self.ext {
            NodeExt::Lib(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_bin(&self) -> Option<&BinExt> {
        match &self.ext {
            NodeExt::Bin(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_bin_mut(&mut self) -> Option<&mut BinExt> {
        match &mut self.ext {
            NodeExt::Bin(ext) => Some(ext),
            _ => None,
        }
    }
    pub fn as_proto(&self) -> Option<&ProtoExt> {
        match &self.ext {
            NodeExt::Proto(ext) => Some(ext),
            _ => None,
        }
    }
}

/// The registry: arena of nodes plus an ordered key index.  The index is
/// ordered so prefix scans ("@pkg/", "/service/") work for dependency globs
/// and exports.
#[derive(Default)]
pub struct Graph {
    files: DenseMap<FileId, Node>,
    pub by_key: BTreeMap<String, FileId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn lookup(&self, key: &str) -> Option<FileId> {
        self.by_key.get(key).copied()
    }

    pub fn insert(&mut self, node: Node) -> FileId {
        let key = node.key.clone();
        let id = self.files.push(node);
        self.by_key.insert(key, id);
        id
    }

    /// Register an extra key for an existing node.
    pub fn alias(&mut self, key: String, id: FileId) {
        self.by_key.entry(key).or_insert(id);
    }

    pub fn node(&self, id: FileId) -> &Node {
        self.files.get(id)
    }

    pub fn node_mut(&mut self, id: FileId) -> &mut Node {
        self.files.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = FileId> + '_ {
        self.files.ids()
    }

    /// Post-order walk over `roots` and their transitive deps.  Roots are
    /// visited in reverse order with a shared seen-set, matching the order
    /// dependency lists are consumed for command composition.
    pub fn visit_deps(
        &self,
        roots: &[FileId],
        seen: &mut HashSet<FileId>,
        visit: &mut dyn FnMut(&Graph, FileId),
    ) {
        for &id in roots.iter().rev() {
            if !seen.insert(id) {
                continue;
            }
            let deps = self.node(id).deps.clone();
            self.visit_deps(&deps, seen, visit);
            visit(self, id);
        }
    }

    /// Add `dep` to `id`'s dependency list.  Duplicate additions are no-ops.
    /// Rejects edges that would close a cycle, and keeps non-object deps
    /// (libraries in particular) ahead of objects so they build first; a
    /// library's generated headers must exist before objects compile.
    pub fn add_dep(&mut self, id: FileId, dep: FileId) -> anyhow::Result<()> {
        if !self.node_mut(id).uniq_deps.insert(dep) {
            return Ok(());
        }
        self.node_mut(id).deps.push(dep);

        let mut seen = HashSet::new();
        let mut cycle = false;
        let roots = self.node(id).deps.clone();
        self.visit_deps(&roots, &mut seen, &mut |_, d| {
            if d == id {
                cycle = true;
            }
        });
        if cycle {
            let node = self.node_mut(id);
            node.deps.pop();
            node.uniq_deps.remove(&dep);
            bail!(
                "detected circular dependency when adding '{}' to '{}'",
                self.node(dep).file,
                self.node(id).file
            );
        }

        if self.node(dep).kind != FileKind::Obj && self.node(id).deps.len() > 1 {
            let last = self.node(id).deps.len() - 1;
            let mut i = last as isize - 1;
            loop {
                if i >= 0 {
                    let di = self.node(id).deps[i as usize];
                    if self.node(di).kind == FileKind::Obj {
                        i -= 1;
                        continue;
                    }
                }
                self.node_mut(id).deps.swap((i + 1) as usize, last);
                break;
            }
        }
        Ok(())
    }

    /// Render the dependency tree under `id`, one node per line, nesting
    /// shown by a growing dot prefix.  System headers are elided.
    pub fn dump_deps(&self, id: FileId) -> String {
        let mut out = String::new();
        let mut indent = String::new();
        self.dump_deps_inner(id, &mut indent, &mut out);
        out
    }

    fn dump_deps_inner(&self, id: FileId, indent: &mut String, out: &mut String) {
        let node = self.node(id);
        if node.file.starts_with("/usr/include/") {
            return;
        }
        if node.kind == FileKind::Header && node.file.starts_with("/usr/") {
            return;
        }
        if !indent.is_empty() {
            out.push_str(indent);
            out.push(' ');
        }
        out.push_str(&node.file);
        out.push('\n');
        indent.push('.');
        for &dep in &self.node(id).deps.clone() {
            self.dump_deps_inner(dep, indent, out);
        }
        indent.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(g: &mut Graph, key: &str, kind: FileKind) -> FileId {
        let mut node = Node::new(key.to_string(), kind);
        node.file = key.to_string();
        g.insert(node)
    }

    #[test]
    fn dep_insertion_is_idempotent() {
        let mut g = Graph::new();
        let a = file_node(&mut g, "/a", FileKind::Lib);
        let b = file_node(&mut g, "/b", FileKind::Lib);
        g.add_dep(a, b).unwrap();
        g.add_dep(a, b).unwrap();
        assert_eq!(g.node(a).deps, vec![b]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut g = Graph::new();
        let a = file_node(&mut g, "/a", FileKind::Lib);
        let b = file_node(&mut g, "/b", FileKind::Lib);
        let c = file_node(&mut g, "/c", FileKind::Lib);
        g.add_dep(a, b).unwrap();
        g.add_dep(b, c).unwrap();
        let err = g.add_dep(c, a).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
        // The offending edge is not left behind.
        assert!(g.node(c).deps.is_empty());
    }

    #[test]
    fn self_cycle_is_rejected() {
        let mut g = Graph::new();
        let a = file_node(&mut g, "/a", FileKind::Lib);
        let b = file_node(&mut g, "/b", FileKind::Lib);
        g.add_dep(a, b).unwrap();
        assert!(g.add_dep(b, a).is_err());
    }

    #[test]
    fn libs_sort_ahead_of_objs() {
        let mut g = Graph::new();
        let bin = file_node(&mut g, "/bin", FileKind::Binary);
        let o1 = file_node(&mut g, "/o1.o", FileKind::Obj);
        let o2 = file_node(&mut g, "/o2.o", FileKind::Obj);
        let l1 = file_node(&mut g, "/l1", FileKind::Lib);
        let l2 = file_node(&mut g, "/l2", FileKind::Lib);
        g.add_dep(bin, o1).unwrap();
        g.add_dep(bin, l1).unwrap();
        g.add_dep(bin, o2).unwrap();
        g.add_dep(bin, l2).unwrap();
        let deps = &g.node(bin).deps;
        let first_obj = deps
            .iter()
            .position(|&d| g.node(d).kind == FileKind::Obj)
            .unwrap();
        assert!(deps[..first_obj]
            .iter()
            .all(|&d| g.node(d).kind == FileKind::Lib));
        assert!(deps[first_obj..]
            .iter()
            .all(|&d| g.node(d).kind == FileKind::Obj));
    }

    #[test]
    fn visit_deps_is_post_order_and_deduped() {
        let mut g = Graph::new();
        let a = file_node(&mut g, "/a", FileKind::Binary);
        let b = file_node(&mut g, "/b", FileKind::Lib);
        let c = file_node(&mut g, "/c", FileKind::Lib);
        let d = file_node(&mut g, "/d", FileKind::Lib);
        g.add_dep(a, b).unwrap();
        g.add_dep(a, c).unwrap();
        g.add_dep(b, d).unwrap();
        g.add_dep(c, d).unwrap();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        g.visit_deps(&[a], &mut seen, &mut |_, id| order.push(id));
        assert_eq!(order.iter().filter(|&&id| id == d).count(), 1);
        // Deps come before their dependents.
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(d) < pos(b));
        assert!(pos(d) < pos(c));
        assert!(pos(b) < pos(a));
    }

    #[test]
    fn generator_substitution() {
        let g = Generator::new("protoc -I${1} --cpp_out=. ${2}");
        assert_eq!(
            g.generate(&["/root", "a.proto"]).unwrap(),
            "protoc -I/root --cpp_out=. a.proto"
        );
        assert!(g.generate(&["/root"]).is_err());
    }

    #[test]
    fn suffix_helpers() {
        assert!(has_suffix("a.cpp", SOURCE_SUFFIXES));
        assert!(!has_suffix("a.o", SOURCE_SUFFIXES));
        assert_eq!(replace_suffix("d/a.cpp", SOURCE_SUFFIXES, ".o"), "d/a.o");
        assert_eq!(replace_suffix("d/a.txt", SOURCE_SUFFIXES, ".o"), "d/a.txt");
        assert_eq!(extension("d/a.pb.cc"), ".cc");
        assert_eq!(extension("bin/tool"), "");
    }
}
