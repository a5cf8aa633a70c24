//! The engine owns every piece of process-wide build state: the node
//! registry, default configs, the compiler table, targets, install
//! registrations, pre/post-build runners, and the content-hash cache.  User
//! rule code drives it through the access/import/add APIs, then calls
//! `build_all`.
//!
//! Rule evaluation is single-threaded; during the parallel build phase the
//! registry is only touched under its mutex (command caching, build-state
//! flags) while subprocesses run unlocked.

use crate::canon::{self, ProjectPaths, BUILD_DIR_NAME};
use crate::compose;
use crate::config::Config;
use crate::db;
use crate::graph::{
    extension, has_suffix, replace_suffix, BinExt, FileId, FileKind, Generator, Graph, LibExt,
    Node, NodeExt, ObjExt, ProtoExt, HEADER_SUFFIXES, SOURCE_SUFFIXES,
};
use crate::hash::HashCache;
use crate::progress::Progress;
use crate::work::{build_parallel, Builder};
use anyhow::{bail, Context};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// How an install destination receives its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    OverwriteExisting,
    CreateSymlink,
}

/// Which default config a flag adjustment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultConfig {
    Object,
    StaticLib,
    SharedLib,
    Binary,
}

pub type Runner = Box<dyn FnMut(&Engine) -> anyhow::Result<()> + Send>;

pub(crate) struct Defaults {
    pub object: Config,
    pub static_lib: Config,
    pub shared_lib: Config,
    pub binary: Config,
}

pub(crate) struct Inner {
    pub graph: Graph,
    /// Directory of the rule file currently being evaluated; the cwd of
    /// every node created while it runs.
    pub cwd: String,
    pub defaults: Defaults,
    /// Default compiler by file extension.
    pub compilers: HashMap<String, String>,
    /// Default generator rules by file extension.
    pub generators: HashMap<String, Generator>,
    pub targets: Vec<FileId>,
    pub target_set: HashSet<FileId>,
    /// Artifact path -> install destinations.
    pub installs: BTreeMap<String, Vec<(String, CopyMode)>>,
}

pub struct Engine {
    paths: ProjectPaths,
    inner: Mutex<Inner>,
    runners_before: Mutex<Vec<Runner>>,
    runners_after: Mutex<Vec<Runner>>,
    hashes: HashCache,
    progress: Progress,
    opt_override: Mutex<Option<i32>>,
}

fn default_compilers() -> HashMap<String, String> {
    let mut table = HashMap::new();
    for suffix in SOURCE_SUFFIXES {
        table.insert(suffix.to_string(), "g++".to_string());
    }
    table.insert(".c".to_string(), "gcc".to_string());
    table.insert(".C".to_string(), "gcc".to_string());
    table.insert(".a".to_string(), "ar".to_string());
    table.insert(".so".to_string(), "g++".to_string());
    table.insert(".proto".to_string(), "protoc".to_string());
    table.insert(".cu".to_string(), "nvcc".to_string());
    table.insert(String::new(), "g++".to_string());
    table
}

impl Engine {
    /// An engine rooted at the current directory (where the build
    /// executable runs).
    pub fn new() -> anyhow::Result<Engine> {
        let cwd = std::env::current_dir().context("current dir")?;
        Engine::with_root(&cwd)
    }

    /// An engine rooted at an explicit project directory.
    pub fn with_root<P: AsRef<Path>>(root: P) -> anyhow::Result<Engine> {
        let root = std::fs::canonicalize(root.as_ref())
            .with_context(|| format!("project root {}", root.as_ref().display()))?;
        let root_str = root
            .to_str()
            .with_context(|| format!("non-utf8 project root {}", root.display()))?;
        let paths = ProjectPaths::new(root_str);

        let mut object = Config::new();
        object.set_flag(&format!("-idirafter {}", paths.build_root));
        let mut static_lib = Config::new();
        static_lib.set_flag("crs");

        let cwd = paths.root.trim_end_matches('/').to_string();
        let cwd = if cwd.is_empty() { "/".to_string() } else { cwd };
        let hashes = HashCache::load(Path::new(&format!("{}BUILD.md5s", paths.build_root)));
        Ok(Engine {
            paths,
            inner: Mutex::new(Inner {
                graph: Graph::new(),
                cwd,
                defaults: Defaults {
                    object,
                    static_lib,
                    shared_lib: Config::new(),
                    binary: Config::new(),
                },
                compilers: default_compilers(),
                generators: HashMap::new(),
                targets: Vec::new(),
                target_set: HashSet::new(),
                installs: BTreeMap::new(),
            }),
            runners_before: Mutex::new(Vec::new()),
            runners_after: Mutex::new(Vec::new()),
            hashes,
            progress: Progress::default(),
            opt_override: Mutex::new(None),
        })
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<Inner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub(crate) fn hashes(&self) -> &HashCache {
        &self.hashes
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn project_root(&self) -> &str {
        &self.paths.root
    }

    pub fn build_root(&self) -> &str {
        &self.paths.build_root
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.progress.set_verbose(verbose);
    }

    pub fn set_debug_level(&self, level: u32) {
        self.progress.set_debug_level(level);
    }

    /// Set the global optimization override applied to composed commands.
    pub fn set_opt_override(&self, level: i32) {
        *self.opt_override.lock().unwrap() = Some(level);
    }

    pub(crate) fn opt_override(&self) -> Option<i32> {
        *self.opt_override.lock().unwrap()
    }

    /// Enter a rule directory: nodes created from here on treat `dir` as
    /// their working directory, the way a per-directory rule file would.
    pub fn set_rule_dir(&self, dir: &str) -> anyhow::Result<()> {
        let abs = {
            let inner = self.lock_inner();
            canon::absolute_path(dir, &inner.cwd)
        };
        if !Path::new(&abs).is_dir() {
            bail!("rule directory({}) doesn't exist", abs);
        }
        let abs = abs.trim_end_matches('/').to_string();
        self.lock_inner().cwd = if abs.is_empty() { "/".to_string() } else { abs };
        Ok(())
    }

    pub fn set_default_compiler(&self, suffix: &str, compiler: &str) {
        self.lock_inner()
            .compilers
            .insert(suffix.to_string(), compiler.to_string());
    }

    pub fn set_default_flags(&self, which: DefaultConfig, flags: &[&str]) {
        let mut inner = self.lock_inner();
        let conf = match which {
            DefaultConfig::Object => &mut inner.defaults.object,
            DefaultConfig::StaticLib => &mut inner.defaults.static_lib,
            DefaultConfig::SharedLib => &mut inner.defaults.shared_lib,
            DefaultConfig::Binary => &mut inner.defaults.binary,
        };
        conf.set_flags(flags);
    }

    pub fn register_default_generator(&self, suffix: &str, rule: &str) {
        self.lock_inner()
            .generators
            .insert(suffix.to_string(), Generator::new(rule));
    }

    pub fn register_runner_before_build(&self, runner: Runner) {
        self.runners_before.lock().unwrap().push(runner);
    }

    pub fn register_runner_after_build(&self, runner: Runner) {
        self.runners_after.lock().unwrap().push(runner);
    }

    fn compiler_for(inner: &Inner, suffix: &str) -> String {
        inner.compilers.get(suffix).cloned().unwrap_or_default()
    }

    fn ensure_artifact_dir(file: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(file).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        Ok(())
    }

    /// Classify `file`, compute its registry key, and look it up, creating a
    /// plain file node when `create` is set.  External '@' names are never
    /// created here; they must come through an import.
    fn access_file_internal(
        &self,
        inner: &mut Inner,
        file: &str,
        create: bool,
        need_build: bool,
        hint: Option<FileKind>,
    ) -> anyhow::Result<Option<FileId>> {
        let mut kind = hint;
        let key = if kind == Some(FileKind::Source) || has_suffix(file, SOURCE_SUFFIXES) {
            kind.get_or_insert(FileKind::Source);
            canon::absolute_path(file, &inner.cwd)
        } else if kind == Some(FileKind::Header) || has_suffix(file, HEADER_SUFFIXES) {
            kind.get_or_insert(FileKind::Header);
            canon::absolute_path(file, &inner.cwd)
        } else if kind == Some(FileKind::Proto) || file.ends_with(".proto") {
            kind.get_or_insert(FileKind::Proto);
            canon::absolute_path(file, &inner.cwd)
        } else {
            self.paths.inner_path(file, &inner.cwd)
        };
        let kind = kind.unwrap_or(FileKind::Normal);

        if let Some(id) = inner.graph.lookup(&key) {
            return Ok(Some(id));
        }
        if !create {
            return Ok(None);
        }
        if file.starts_with('@') {
            bail!(
                "can't create external library({}), please import it first",
                file
            );
        }
        let mut node = Node::new(key.clone(), kind);
        node.file = if need_build {
            let path = self.paths.build_path(&key, &inner.cwd);
            Self::ensure_artifact_dir(&path)?;
            path
        } else {
            key
        };
        node.name = canon::file_name(&node.file).to_string();
        node.cwd = inner.cwd.clone();
        node.compiler = Self::compiler_for(inner, extension(&node.file));
        node.build_done = !need_build;
        Ok(Some(inner.graph.insert(node)))
    }

    /// Create or look up a generic file node.  Useful for files that need no
    /// build themselves but carry dependencies, or for generator outputs.
    pub fn access_file(
        &self,
        file: &str,
        need_build: bool,
        kind: Option<FileKind>,
    ) -> anyhow::Result<FileId> {
        let mut inner = self.lock_inner();
        Ok(self
            .access_file_internal(&mut inner, file, true, need_build, kind)?
            .expect("created"))
    }

    /// Create or look up the object compiled from `src_file`.  The object
    /// file defaults to the source path with its suffix replaced by `.o`,
    /// mapped under the build root; `obj_file` overrides that, e.g. to
    /// compile one source twice under different flags.
    pub fn access_object(&self, src_file: &str, obj_file: Option<&str>) -> anyhow::Result<FileId> {
        let (id, depfile_pending) = {
            let mut inner = self.lock_inner();
            let obj_path = match obj_file {
                Some(obj) => {
                    let inner_path = self.paths.inner_path(obj, &inner.cwd);
                    self.paths.build_path(&inner_path, &inner.cwd)
                }
                None => {
                    let obj = replace_suffix(src_file, SOURCE_SUFFIXES, ".o");
                    self.paths.build_path(&obj, &inner.cwd)
                }
            };
            if let Some(id) = inner.graph.lookup(&obj_path) {
                if inner.graph.node(id).kind != FileKind::Obj {
                    bail!("'{}' is not an object", obj_path);
                }
                return Ok(id);
            }

            let src = canon::absolute_path(src_file, &inner.cwd);
            let mut node = Node::new(obj_path.clone(), FileKind::Obj);
            node.name = src_file.to_string();
            node.file = obj_path.clone();
            node.cwd = inner.cwd.clone();
            node.compiler = Self::compiler_for(&inner, extension(&src));
            node.ext = NodeExt::Obj(ObjExt {
                src: src.clone(),
                ..ObjExt::default()
            });
            Self::ensure_artifact_dir(&node.file)?;
            let id = inner.graph.insert(node);

            // The `.d` file from the last compile names every header this
            // object actually included; each becomes a dep.  When it doesn't
            // exist yet it is parsed right after the first build instead.
            let dep_file = format!("{}.d", obj_path);
            let mut depfile_pending = None;
            if Path::new(&dep_file).exists() {
                self.load_depfile_locked(&mut inner, id, &dep_file)?;
            } else {
                depfile_pending = Some(dep_file);
            }

            let src_id = self
                .access_file_internal(&mut inner, &src, true, false, None)?
                .expect("created");
            inner.graph.add_dep(id, src_id)?;
            (id, depfile_pending)
        };
        if let Some(dep_file) = depfile_pending {
            self.register_runner_after_build(Box::new(move |engine: &Engine| {
                if !Path::new(&dep_file).exists() {
                    return Ok(());
                }
                let mut inner = engine.lock_inner();
                engine.load_depfile_locked(&mut inner, id, &dep_file)
            }));
        }
        Ok(id)
    }

    fn load_depfile_locked(
        &self,
        inner: &mut Inner,
        id: FileId,
        dep_file: &str,
    ) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(dep_file)
            .with_context(|| format!("read {}", dep_file))?;
        let deps = crate::depfile::parse(&text)
            .with_context(|| format!("can't parse the dependence file({})", dep_file))?;
        for dep in deps {
            // Deliberately no existence check: a renamed header must still
            // become a dep so the rebuild happens.
            let dep_id = self
                .access_file_internal(inner, &dep, true, false, None)?
                .expect("created");
            inner.graph.add_dep(id, dep_id)?;
        }
        Ok(())
    }

    /// Create or look up a library.  `is_static` only matters at creation;
    /// '@' names must have been imported.  Library artifacts land under the
    /// build root as `lib<name>.a` / `lib<name>.so`.
    pub fn access_library(&self, lib_name: &str, is_static: bool) -> anyhow::Result<FileId> {
        let mut inner = self.lock_inner();
        self.access_library_locked(&mut inner, lib_name, is_static)
    }

    fn access_library_locked(
        &self,
        inner: &mut Inner,
        lib_name: &str,
        is_static: bool,
    ) -> anyhow::Result<FileId> {
        let name = self.paths.formalize_lib_name(lib_name, false, &inner.cwd)?;
        let mut id = inner.graph.lookup(&name);
        if id.is_none() {
            if name.starts_with('@') {
                bail!(
                    "the third-party lib({}) must be imported first before use",
                    lib_name
                );
            }
            // "/dir/x/x" and "/dir/x" address the same library when it is
            // named after its directory.
            let leaf = canon::file_name(&name).to_string();
            if name.ends_with(&format!("/{}/{}", leaf, leaf)) {
                let short = name
                    .strip_suffix(&format!("/{}", leaf))
                    .unwrap()
                    .to_string();
                if let Some(existing) = inner.graph.lookup(&short) {
                    inner.graph.alias(name.clone(), existing);
                    id = Some(existing);
                }
            }
        }

        match id {
            Some(id) => {
                if inner.graph.node(id).kind != FileKind::Lib {
                    bail!("'{}' is not a library", inner.graph.node(id).file);
                }
                // Re-accessing from another rule directory may provide a
                // better working directory for the library.
                let cwd = inner.cwd.clone();
                let node = inner.graph.node_mut(id);
                if node.cwd != cwd {
                    if !lib_name.contains('/') {
                        node.cwd = cwd;
                    } else {
                        let rel_old = canon::lexically_relative(&node.file, &node.cwd);
                        let rel_new = canon::lexically_relative(&node.file, &cwd);
                        if !rel_new.starts_with("../")
                            && (rel_old.starts_with("../") || rel_new.len() < rel_old.len())
                        {
                            node.cwd = cwd;
                        }
                    }
                }
                Ok(id)
            }
            None => {
                let mut lib_file = name.clone();
                if !lib_file.ends_with(".a") && !lib_file.ends_with(".so") {
                    lib_file.push_str(if is_static { ".a" } else { ".so" });
                }
                if !canon::file_name(&lib_file).starts_with("lib") {
                    lib_file = format!(
                        "{}lib{}",
                        canon::dir_name(&lib_file),
                        canon::file_name(&lib_file)
                    );
                }
                let file = self.paths.build_path(&lib_file, &inner.cwd);
                Self::ensure_artifact_dir(&file)?;
                let mut node = Node::new(name.clone(), FileKind::Lib);
                node.name = name;
                node.file = file;
                node.cwd = inner.cwd.clone();
                node.compiler = Self::compiler_for(inner, extension(&node.file));
                node.ext = NodeExt::Lib(LibExt {
                    is_static,
                    ..LibExt::default()
                });
                Ok(inner.graph.insert(node))
            }
        }
    }

    /// Create or look up a binary target.
    pub fn access_binary(&self, bin_name: &str) -> anyhow::Result<FileId> {
        let mut inner = self.lock_inner();
        let key = self.paths.inner_path(bin_name, &inner.cwd);
        if let Some(id) = inner.graph.lookup(&key) {
            if inner.graph.node(id).kind != FileKind::Binary {
                bail!("'{}' is not a binary", inner.graph.node(id).file);
            }
            return Ok(id);
        }
        let file = self.paths.build_path(bin_name, &inner.cwd);
        Self::ensure_artifact_dir(&file)?;
        let mut node = Node::new(key.clone(), FileKind::Binary);
        node.name = key;
        node.file = file;
        node.cwd = inner.cwd.clone();
        node.compiler = Self::compiler_for(&inner, extension(&node.file));
        node.ext = NodeExt::Bin(BinExt::default());
        Ok(inner.graph.insert(node))
    }

    /// Create or look up a protobuf source node.  Its generated `.pb.h` and
    /// `.pb.cc` are registered as generated-by-dep files pointing back here,
    /// so asking for either triggers `protoc`.
    pub fn access_proto(&self, proto_file: &str) -> anyhow::Result<FileId> {
        let mut inner = self.lock_inner();
        let key = canon::absolute_path(proto_file, &inner.cwd);
        if let Some(id) = inner.graph.lookup(&key) {
            if inner.graph.node(id).kind != FileKind::Proto {
                bail!("'{}' is not a proto", inner.graph.node(id).file);
            }
            return Ok(id);
        }
        let mut node = Node::new(key.clone(), FileKind::Proto);
        node.name = canon::file_name(&key).to_string();
        node.file = key.clone();
        node.cwd = inner.cwd.clone();
        node.compiler = Self::compiler_for(&inner, ".proto");
        node.ext = NodeExt::Proto(ProtoExt::default());
        let id = inner.graph.insert(node);

        for (suffix, kind) in [(".pb.h", FileKind::Header), (".pb.cc", FileKind::Source)] {
            let generated = replace_suffix(&key, &[".proto"], suffix);
            let path = self.paths.build_path(&generated, &inner.cwd);
            let gen_id = self
                .access_file_internal(&mut inner, &path, true, true, Some(kind))?
                .expect("created");
            inner.graph.node_mut(gen_id).generated_by_dep = true;
            inner.graph.add_dep(gen_id, id)?;
        }
        Ok(id)
    }

    /// Spawn (or look up) the object that compiles this proto's generated
    /// `.pb.cc`, wiring deps so `protoc` runs first, transitively for any
    /// dependent protos.
    pub fn spawn_obj(&self, proto: FileId) -> anyhow::Result<FileId> {
        let (proto_file, proto_cwd) = {
            let inner = self.lock_inner();
            let node = inner.graph.node(proto);
            if node.kind != FileKind::Proto {
                bail!("'{}' is not a proto", node.file);
            }
            (node.file.clone(), node.cwd.clone())
        };
        let src_path = {
            let pb_cc = replace_suffix(&proto_file, &[".proto"], ".pb.cc");
            self.paths.build_path(&pb_cc, &proto_cwd)
        };
        let hdr_path = {
            let pb_h = replace_suffix(&proto_file, &[".proto"], ".pb.h");
            self.paths.build_path(&pb_h, &proto_cwd)
        };
        let obj = self.access_object(&src_path, None)?;
        let hdr = self.access_file(&hdr_path, false, None)?;
        self.add_dep(obj, hdr)?;
        let src = self.access_file(&src_path, false, None)?;
        self.add_dep(obj, src)?;
        {
            let mut inner = self.lock_inner();
            let src_cwd = inner.graph.node(src).cwd.clone();
            let inc = self.paths.build_path(&src_cwd, &src_cwd);
            let build_root = self.paths.build_root.clone();
            let ext = inner.graph.node_mut(obj).as_obj_mut().expect("object");
            compose::obj_add_include_dir(ext, &inc);
            // All generated headers resolve relative to the build root.
            compose::obj_add_include_dir(ext, &build_root);
        }

        // A proto that imports another proto must see that proto's
        // generated code too; depend on the dependent `.pb.cc` so protoc
        // runs for it first.
        let mut dep_protos = Vec::new();
        {
            let inner = self.lock_inner();
            let roots = inner.graph.node(obj).deps.clone();
            let mut seen = HashSet::new();
            inner.graph.visit_deps(&roots, &mut seen, &mut |g, d| {
                if g.node(d).kind == FileKind::Proto && d != proto {
                    dep_protos.push(d);
                }
            });
        }
        for dep in dep_protos {
            let (dep_file, dep_cwd) = {
                let inner = self.lock_inner();
                let node = inner.graph.node(dep);
                (node.file.clone(), node.cwd.clone())
            };
            let pb_cc = replace_suffix(&dep_file, &[".proto"], ".pb.cc");
            let pb_cc_path = self.paths.build_path(&pb_cc, &dep_cwd);
            let pb_src = self.access_file(&pb_cc_path, false, None)?;
            self.add_dep(obj, pb_src)?;
            let mut inner = self.lock_inner();
            let src_cwd = inner.graph.node(pb_src).cwd.clone();
            let inc = self.paths.build_path(&src_cwd, &src_cwd);
            let ext = inner.graph.node_mut(obj).as_obj_mut().expect("object");
            compose::obj_add_include_dir(ext, &inc);
        }
        Ok(obj)
    }

    /// Import a prebuilt third-party library by name, include dirs, and
    /// archive path.  An empty `lib_file` imports a header-only or purely
    /// virtual library.
    pub fn import_library(
        &self,
        lib_name: &str,
        inc_dirs: &[&str],
        lib_file: &str,
    ) -> anyhow::Result<FileId> {
        let mut inner = self.lock_inner();
        self.import_library_locked(&mut inner, lib_name, inc_dirs, lib_file)
    }

    fn import_library_locked(
        &self,
        inner: &mut Inner,
        lib_name: &str,
        inc_dirs: &[&str],
        lib_file: &str,
    ) -> anyhow::Result<FileId> {
        let name = self.paths.formalize_lib_name(lib_name, true, &inner.cwd)?;
        if let Some(id) = inner.graph.lookup(&name) {
            let node = inner.graph.node(id);
            if node.kind != FileKind::Lib {
                bail!("'{}' is not a library", node.file);
            }
            if !lib_file.is_empty() {
                let abs = canon::absolute_path(lib_file, &inner.cwd);
                if node.file != abs {
                    bail!(
                        "imported lib({}) conflicts, lib_file: prev({}) vs cur({})",
                        name,
                        node.file,
                        lib_file
                    );
                }
            }
            return Ok(id);
        }

        // No check on lib_file: a virtual lib recording only deps may be
        // imported.  Include dirs must exist though.
        let mut incs = std::collections::BTreeSet::new();
        for dir in inc_dirs {
            let abs = canon::absolute_path(dir, &inner.cwd);
            if !Path::new(&abs).exists() {
                bail!("the include dir({}) doesn't exist", dir);
            }
            incs.insert(abs);
        }
        let file = if lib_file.is_empty() {
            String::new()
        } else {
            canon::absolute_path(lib_file, &inner.cwd)
        };
        let mut node = Node::new(name.clone(), FileKind::Lib);
        node.name = name.clone();
        node.cwd = inner.cwd.clone();
        node.compiler = Self::compiler_for(inner, "");
        node.build_done = true;
        node.ext = NodeExt::Lib(LibExt {
            is_static: file.ends_with(".a"),
            imported: true,
            inc_dirs: incs.clone(),
            ..LibExt::default()
        });
        node.file = file.clone();
        let id = inner.graph.insert(node);
        self.progress.debug(
            1,
            &format!(
                "import '{}' library, inc_dir:{}, lib:{}",
                name,
                incs.iter().cloned().collect::<Vec<_>>().join(";"),
                file
            ),
        );
        Ok(id)
    }

    /// Import every `lib*.a` / `lib*.so` under `dir/lib`, exposing
    /// `dir/include`.  A package with a single library is also addressable
    /// as `@pkg` alone.
    pub fn import_libraries(&self, pkg_name: &str, dir: &str) -> anyhow::Result<Vec<FileId>> {
        let name = pkg_name
            .trim_start_matches('@')
            .trim_end_matches('/')
            .to_string();
        if name.contains('/') {
            bail!(
                "pkg_name({}) should not contain '/' in the middle of it",
                pkg_name
            );
        }
        let dir_abs = {
            let inner = self.lock_inner();
            canon::absolute_path(dir, &inner.cwd)
        };
        let inc_dir = format!("{}/include", dir_abs.trim_end_matches('/'));
        let lib_dir = format!("{}/lib", dir_abs.trim_end_matches('/'));
        if !Path::new(&lib_dir).is_dir() {
            bail!(
                "can't find 'lib' dir under {}, and please use import_library for header only lib",
                dir_abs
            );
        }
        let mut lib_files: Vec<String> = std::fs::read_dir(&lib_dir)
            .with_context(|| format!("list {}", lib_dir))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|f| f.starts_with("lib") && (f.ends_with(".a") || f.ends_with(".so")))
            .collect();
        lib_files.sort();

        let mut result = Vec::new();
        for file in &lib_files {
            // Prefer the static archive when both flavors exist.
            if let Some(stem) = file.strip_suffix(".so") {
                if lib_files.contains(&format!("{}.a", stem)) {
                    continue;
                }
            }
            let stem = file
                .strip_suffix(".a")
                .or_else(|| file.strip_suffix(".so"))
                .unwrap();
            let lib_name = stem.strip_prefix("lib").unwrap();
            result.push(self.import_library(
                &format!("{}/{}", name, lib_name),
                &[&inc_dir],
                &format!("{}/{}", lib_dir, file),
            )?);
        }
        if result.is_empty() {
            bail!("there's no any library imported under {}", dir_abs);
        }
        if result.len() == 1 {
            let mut inner = self.lock_inner();
            for alias in [format!("{}/{}", name, name), format!("{}/", name)] {
                let key = self.paths.formalize_lib_name(&alias, true, &inner.cwd)?;
                inner.graph.alias(key, result[0]);
            }
        }
        Ok(result)
    }

    /// Import another project built by this tool via its exported
    /// `BUILD.libs` table; its libraries become `@<name>/...`.
    pub fn import_external_project(
        &self,
        ext_prj_name: &str,
        ext_prj_path: &str,
    ) -> anyhow::Result<()> {
        let mut name = ext_prj_name.trim_end_matches('/').to_string();
        if !name.starts_with('@') {
            name.insert(0, '@');
        }
        let ext_root = {
            let inner = self.lock_inner();
            canon::absolute_path(ext_prj_path, &inner.cwd)
                .trim_end_matches('/')
                .to_string()
        };
        let libs_file = format!("{}/{}/BUILD.libs", ext_root, BUILD_DIR_NAME);
        if !Path::new(&libs_file).exists() {
            bail!(
                "there's no BUILD.libs under this project({}), build it with library export first",
                ext_root
            );
        }
        let text = std::fs::read_to_string(&libs_file)
            .with_context(|| format!("read {}", libs_file))?;
        let (rows, invalid) = db::parse_libs_table(&text);
        for line in invalid {
            self.progress
                .warn(&format!("invalid line({}) in {}", line, libs_file));
        }

        let bare = name.trim_start_matches('@').to_string();
        let mut dep_infos = Vec::new();
        for row in rows {
            let incs: Vec<&str> = row.inc_dirs.iter().map(|s| s.as_str()).collect();
            if row.name.starts_with('@') {
                // An external library that project itself imported.
                self.import_library(&row.name, &incs, &row.file)?;
                continue;
            }
            let id = self.import_library(&format!("{}{}", name, row.name), &incs, &row.file)?;
            {
                let mut inner = self.lock_inner();
                if let Some(lib) = inner.graph.node_mut(id).as_lib_mut() {
                    lib.inc_dirs.insert(ext_root.clone());
                }
            }
            if let Some(deps) = &row.deps {
                if !deps.is_empty() {
                    dep_infos.push((id, deps.clone()));
                }
            }
            if row.name == format!("/{}", bare) {
                // The project's namesake library is addressable as the bare
                // package name.
                let mut inner = self.lock_inner();
                let key = self
                    .paths
                    .formalize_lib_name(ext_prj_name, true, &inner.cwd)?;
                inner.graph.alias(key, id);
            }
        }
        for (id, deps) in dep_infos {
            for dep in deps {
                if dep.starts_with('@') {
                    self.add_dep_libs(id, &[dep])?;
                } else {
                    self.add_dep_libs(id, &[format!("{}{}", name, dep)])?;
                }
            }
        }
        Ok(())
    }

    pub fn add_dep(&self, id: FileId, dep: FileId) -> anyhow::Result<()> {
        self.lock_inner().graph.add_dep(id, dep)
    }

    /// Add a dependency by name; the node must already exist.
    pub fn add_dep_name(&self, id: FileId, dep: &str) -> anyhow::Result<()> {
        let dep_id = {
            let mut inner = self.lock_inner();
            self.access_file_internal(&mut inner, dep, false, false, None)?
        };
        let Some(dep_id) = dep_id else {
            bail!(
                "no this dep({}), please use the access APIs to create it first",
                dep
            );
        };
        self.add_dep(id, dep_id)
    }

    /// Add dependent libraries by name.  Supports whole-package references
    /// ("@boost", "@boost/*") and directory prefixes ("/service/"); a
    /// directory reference resolves just before the build so later rule
    /// files can still register libraries under it.
    pub fn add_dep_libs<S: AsRef<str>>(&self, id: FileId, dep_libs: &[S]) -> anyhow::Result<()> {
        for dep in dep_libs {
            let mut dep_name = {
                let inner = self.lock_inner();
                self.paths
                    .formalize_lib_name(dep.as_ref(), false, &inner.cwd)?
            };
            let mut is_glob = dep_name.ends_with('/');
            if dep_name.ends_with('*') {
                dep_name.pop();
                if dep_name.contains('*') {
                    bail!("contain '*' in the middle of dep name({})", dep_name);
                }
                is_glob = true;
            }
            if dep_name.starts_with('@') && !is_glob {
                let pkg = dep_name[1..].split('/').next().unwrap_or("").to_string();
                if dep_name == format!("@{}/{}", pkg, pkg) {
                    let found = self.lock_inner().graph.lookup(&dep_name);
                    if let Some(found) = found {
                        self.add_dep(id, found)?;
                        continue;
                    }
                    dep_name = format!("@{}/", pkg);
                    is_glob = true;
                }
            }
            if !dep_name.starts_with('@') {
                let on_disk = format!("{}{}", self.paths.root.trim_end_matches('/'), dep_name);
                if is_glob || Path::new(&on_disk).is_dir() {
                    if !dep_name.ends_with('/') {
                        dep_name.push('/');
                    }
                    // Defer: libraries under this directory may not all be
                    // registered yet.
                    self.register_runner_before_build(Box::new(move |engine: &Engine| {
                        engine.add_dep_libs_scan(id, &dep_name, true)
                    }));
                    continue;
                }
            }
            self.add_dep_libs_scan(id, &dep_name, is_glob)?;
        }
        Ok(())
    }

    fn add_dep_libs_scan(&self, id: FileId, dep_name: &str, is_glob: bool) -> anyhow::Result<()> {
        let matches: Vec<FileId> = {
            let inner = self.lock_inner();
            let prefix = if is_glob {
                dep_name.to_string()
            } else {
                format!("{}/", dep_name)
            };
            inner
                .graph
                .by_key
                .range(dep_name.to_string()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .filter(|(_, &fid)| inner.graph.node(fid).kind == FileKind::Lib)
                .map(|(_, &fid)| fid)
                .collect()
        };
        if matches.is_empty() {
            if is_glob {
                bail!("can't find any lib with the '{}' prefix", dep_name);
            }
            let lib = self.access_library(dep_name, true)?;
            return self.add_dep(id, lib);
        }
        for lib in matches {
            self.add_dep(id, lib)?;
        }
        Ok(())
    }

    /// Add an object to a library or binary.  Registers the parent as a
    /// user of the object; shared-library objects get `-fPIC`.
    pub fn add_obj(&self, parent: FileId, obj: FileId) -> anyhow::Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.graph.node(obj).kind != FileKind::Obj {
                bail!(
                    "for {}, '{}' is not an object",
                    inner.graph.node(parent).file,
                    inner.graph.node(obj).file
                );
            }
            let (needs_pic, flags) = match &inner.graph.node(parent).ext {
                NodeExt::Lib(lib) => (!lib.is_static, lib.objs_flags.clone()),
                NodeExt::Bin(bin) => (false, bin.objs_flags.clone()),
                _ => bail!(
                    "'{}' can't hold objects",
                    inner.graph.node(parent).file
                ),
            };
            {
                let obj_node = inner.graph.node_mut(obj);
                if needs_pic && !obj_node.config_mut().has_flag("-fPIC") {
                    obj_node.config_mut().set_flag("-fPIC");
                }
                obj_node.config_mut().set_flags(&flags);
                if let Some(ext) = obj_node.as_obj_mut() {
                    ext.users.push(parent);
                }
            }
            match &mut inner.graph.node_mut(parent).ext {
                NodeExt::Lib(lib) => lib.objs.push(obj),
                NodeExt::Bin(bin) => bin.objs.push(obj),
                _ => unreachable!(),
            }
        }
        self.add_dep(parent, obj)
    }

    /// Add objects by source path.  With `bind`, object names are derived
    /// from the parent so the same sources can be compiled separately per
    /// target (e.g. a `-DTEST_MODE` variant).
    pub fn add_objs(&self, parent: FileId, src_files: &[&str], bind: bool) -> anyhow::Result<()> {
        let parent_name = {
            let inner = self.lock_inner();
            inner.graph.node(parent).name.clone()
        };
        for src in src_files {
            let obj_name = if bind {
                let suffix = parent_name.replace('/', "-").replace('.', "-");
                Some(replace_suffix(src, SOURCE_SUFFIXES, &format!("{}.o", suffix)))
            } else {
                None
            };
            let obj = self.access_object(src, obj_name.as_deref())?;
            self.add_obj(parent, obj)?;
        }
        Ok(())
    }

    /// Record flags applied to all of a target's objects, present and
    /// future.
    pub fn set_objs_flags(&self, parent: FileId, flags: &[&str]) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if !matches!(
            inner.graph.node(parent).kind,
            FileKind::Lib | FileKind::Binary
        ) {
            bail!("'{}' can't hold objects", inner.graph.node(parent).file);
        }
        let objs = match &mut inner.graph.node_mut(parent).ext {
            NodeExt::Lib(lib) => {
                lib.objs_flags.extend(flags.iter().map(|f| f.to_string()));
                lib.objs.clone()
            }
            NodeExt::Bin(bin) => {
                bin.objs_flags.extend(flags.iter().map(|f| f.to_string()));
                bin.objs.clone()
            }
            _ => unreachable!(),
        };
        for obj in objs {
            inner.graph.node_mut(obj).config_mut().set_flags(flags);
        }
        Ok(())
    }

    /// Add a library to a shared library or a binary.  Static libraries
    /// cannot embed other libraries; whole-archive linking into a binary
    /// requires a static library.
    pub fn add_lib(&self, parent: FileId, lib: FileId, whole_archive: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.graph.node(lib).kind != FileKind::Lib {
                bail!(
                    "for {}, '{}' is not a library",
                    inner.graph.node(parent).file,
                    inner.graph.node(lib).file
                );
            }
            match inner.graph.node(parent).kind {
                FileKind::Lib => {
                    let parent_static = inner
                        .graph
                        .node(parent)
                        .as_lib()
                        .map(|l| l.is_static)
                        .unwrap_or(true);
                    if parent_static {
                        bail!(
                            "can't add library({}) to build a static library({})",
                            inner.graph.node(lib).file,
                            inner.graph.node(parent).file
                        );
                    }
                    // Everything folded into a shared library must be
                    // position independent.
                    let objs = inner.graph.node(lib).as_lib().unwrap().objs.clone();
                    for obj in objs {
                        let conf = inner.graph.node_mut(obj).config_mut();
                        if !conf.has_flag("-fPIC") {
                            conf.set_flag("-fPIC");
                        }
                    }
                    let ext = inner.graph.node_mut(parent).as_lib_mut().unwrap();
                    if whole_archive {
                        ext.whole_archive_libs.push(lib);
                    } else {
                        ext.libs.push(lib);
                    }
                }
                FileKind::Binary => {
                    if whole_archive {
                        let is_static = inner
                            .graph
                            .node(lib)
                            .as_lib()
                            .map(|l| l.is_static)
                            .unwrap_or(false);
                        if !is_static {
                            bail!(
                                "for binary({}), can't add shared lib({}) in whole-archive way",
                                inner.graph.node(parent).file,
                                inner.graph.node(lib).file
                            );
                        }
                    }
                    let ext = inner.graph.node_mut(parent).as_bin_mut().unwrap();
                    if whole_archive {
                        ext.whole_archive_libs.push(lib);
                    } else {
                        ext.libs.push(lib);
                    }
                }
                _ => bail!(
                    "'{}' can't hold libraries",
                    inner.graph.node(parent).file
                ),
            }
        }
        self.add_dep(parent, lib)
    }

    pub fn add_lib_name(
        &self,
        parent: FileId,
        lib_name: &str,
        whole_archive: bool,
    ) -> anyhow::Result<()> {
        let lib = self.access_library(lib_name, true)?;
        self.add_lib(parent, lib, whole_archive)
    }

    /// Add a proto to a library: the library archives the generated
    /// `.pb.o`, and depends on the imported protobuf runtime if present.
    pub fn add_proto(&self, lib: FileId, proto_file: &str) -> anyhow::Result<()> {
        let runtime_libs: Vec<FileId> = {
            let inner = self.lock_inner();
            let already = inner
                .graph
                .node(lib)
                .as_lib()
                .map(|l| l.added_proto_runtime)
                .unwrap_or(true);
            if already {
                Vec::new()
            } else {
                inner
                    .graph
                    .by_key
                    .range("@protobuf/".to_string()..)
                    .take_while(|(key, _)| key.starts_with("@protobuf/"))
                    .filter(|(_, &fid)| inner.graph.node(fid).kind == FileKind::Lib)
                    .map(|(_, &fid)| fid)
                    .collect()
            }
        };
        for runtime in &runtime_libs {
            self.add_dep(lib, *runtime)?;
        }
        if !runtime_libs.is_empty() {
            let mut inner = self.lock_inner();
            if let Some(ext) = inner.graph.node_mut(lib).as_lib_mut() {
                ext.added_proto_runtime = true;
            }
        }
        let proto = self.access_proto(proto_file)?;
        let obj = self.spawn_obj(proto)?;
        self.add_obj(lib, obj)
    }

    pub fn add_protos(&self, lib: FileId, proto_files: &[&str]) -> anyhow::Result<()> {
        for proto in proto_files {
            self.add_proto(lib, proto)?;
        }
        Ok(())
    }

    /// Declare an include directory.  On an object it feeds `-idirafter`;
    /// on a library it is what users of the library see.  `create_alias`
    /// symlinks the library's directory under the build tree so sources can
    /// include through the alias prefix.
    pub fn add_include_dir(
        &self,
        id: FileId,
        dir: &str,
        create_alias: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        let cwd = inner.cwd.clone();
        match inner.graph.node(id).kind {
            FileKind::Obj => {
                if dir.is_empty() {
                    return Ok(());
                }
                let abs = canon::absolute_path(dir, &cwd);
                let ext = inner.graph.node_mut(id).as_obj_mut().unwrap();
                compose::obj_add_include_dir(ext, &abs);
            }
            FileKind::Lib => {
                if !create_alias {
                    let abs = canon::absolute_path(dir, &cwd);
                    inner
                        .graph
                        .node_mut(id)
                        .as_lib_mut()
                        .unwrap()
                        .inc_dirs
                        .insert(abs);
                    return Ok(());
                }
                let node_cwd = inner.graph.node(id).cwd.clone();
                let cwd_build = self.paths.build_path(&node_cwd, &node_cwd);
                inner
                    .graph
                    .node_mut(id)
                    .as_lib_mut()
                    .unwrap()
                    .inc_dirs
                    .insert(cwd_build.clone());
                let alias = dir.trim_end_matches('/');
                let alias_path = canon::canon_path(&format!("{}/{}", cwd_build, alias));
                if let Ok(meta) = std::fs::symlink_metadata(&alias_path) {
                    if meta.file_type().is_symlink() {
                        if let Ok(target) = std::fs::read_link(&alias_path) {
                            if target == Path::new(&node_cwd) {
                                return Ok(());
                            }
                        }
                    }
                    bail!(
                        "create alias({}) for lib inc dir failed, since it exists already",
                        alias_path
                    );
                }
                if let Some(parent) = Path::new(&alias_path).parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                std::os::unix::fs::symlink(&node_cwd, &alias_path)
                    .with_context(|| format!("symlink {} -> {}", alias_path, node_cwd))?;
            }
            _ => bail!(
                "'{}' doesn't take include dirs",
                inner.graph.node(id).file
            ),
        }
        Ok(())
    }

    /// Add an explicit `-L` directory to a binary's link line.
    pub fn add_link_dir(&self, id: FileId, dir: &str) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if inner.graph.node(id).kind != FileKind::Binary {
            bail!("'{}' is not a binary", inner.graph.node(id).file);
        }
        let cwd = inner.cwd.clone();
        let abs = canon::absolute_path(dir, &cwd);
        inner
            .graph
            .node_mut(id)
            .as_bin_mut()
            .unwrap()
            .link_dirs
            .push(abs);
        Ok(())
    }

    /// Flags a library contributes to the link line of whatever links it.
    pub fn set_link_flags(&self, id: FileId, flags: &[&str]) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if inner.graph.node(id).kind != FileKind::Lib {
            bail!("'{}' is not a library", inner.graph.node(id).file);
        }
        inner
            .graph
            .node_mut(id)
            .as_lib_mut()
            .unwrap()
            .link_conf
            .set_flags(flags);
        Ok(())
    }

    /// Mark a library to always link whole-archive.
    pub fn set_whole_archive(&self, id: FileId) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if inner.graph.node(id).kind != FileKind::Lib {
            bail!("'{}' is not a library", inner.graph.node(id).file);
        }
        inner.graph.node_mut(id).as_lib_mut().unwrap().whole_archive = true;
        Ok(())
    }

    pub fn add_proto_import_dir(&self, id: FileId, dir: &str) -> anyhow::Result<()> {
        let mut inner = self.lock_inner();
        if inner.graph.node(id).kind != FileKind::Proto {
            bail!("'{}' is not a proto", inner.graph.node(id).file);
        }
        match &mut inner.graph.node_mut(id).ext {
            NodeExt::Proto(ext) => ext.import_dirs.push(dir.to_string()),
            _ => unreachable!(),
        }
        Ok(())
    }

    pub fn set_flag(&self, id: FileId, flag: &str) {
        self.lock_inner()
            .graph
            .node_mut(id)
            .config_mut()
            .set_flag(flag);
    }

    pub fn set_flags(&self, id: FileId, flags: &[&str]) {
        self.lock_inner()
            .graph
            .node_mut(id)
            .config_mut()
            .set_flags(flags);
    }

    pub fn set_config(&self, id: FileId, conf: &Config) {
        let mut inner = self.lock_inner();
        let node = inner.graph.node_mut(id);
        if node.config.as_ref().map(|c| !c.is_empty()).unwrap_or(false) {
            let file = node.file.clone();
            node.config = Some(conf.clone());
            drop(inner);
            self.progress
                .warn(&format!("substitute the existed config for file '{}'", file));
            return;
        }
        node.config = Some(conf.clone());
    }

    pub fn set_generator(&self, id: FileId, rule: &str) {
        self.lock_inner().graph.node_mut(id).generator = Some(Generator::new(rule));
    }

    /// Override the full command, bypassing composition.  Best done from a
    /// pre-build runner, after all targets are defined.
    pub fn set_full_command(&self, id: FileId, cmd: &str) {
        self.lock_inner().graph.node_mut(id).cmd = if cmd.is_empty() {
            None
        } else {
            Some(cmd.to_string())
        };
    }

    /// The composed command, composing now if needed.  `pretty` breaks the
    /// command into one argument per line after the output file.
    pub fn get_full_command(&self, id: FileId, pretty: bool) -> anyhow::Result<String> {
        let cmd = {
            let mut inner = self.lock_inner();
            if inner.graph.node(id).cmd.is_none() {
                compose::compose_command(
                    &mut inner,
                    &self.paths,
                    self.opt_override(),
                    &self.progress,
                    id,
                )?;
            }
            inner.graph.node(id).cmd.clone().unwrap_or_default()
        };
        if !pretty {
            return Ok(cmd);
        }
        if let Some(p) = cmd.find(" -o ") {
            if let Some(rest) = cmd[p + 4..].find(' ') {
                let split = p + 4 + rest;
                return Ok(format!(
                    "{}{}",
                    &cmd[..split],
                    cmd[split..].replace(' ', "\n")
                ));
            }
        }
        Ok(cmd.replace(' ', "\n"))
    }

    pub fn dump_deps(&self, id: FileId) -> String {
        self.lock_inner().graph.dump_deps(id)
    }

    /// Map a user path into the build tree, as the registry would.
    pub fn to_build_path(&self, path: &str) -> String {
        let inner = self.lock_inner();
        self.paths.build_path(path, &inner.cwd)
    }

    /// Look up an existing node by user-facing name, without creating it.
    pub fn find_target(&self, name: &str) -> Option<FileId> {
        let mut inner = self.lock_inner();
        self.access_file_internal(&mut inner, name, false, false, None)
            .ok()
            .flatten()
    }

    pub fn add_target(&self, name: &str) -> anyhow::Result<FileId> {
        let Some(id) = self.find_target(name) else {
            bail!(
                "can't find a target that has been defined by this name({})",
                name
            );
        };
        self.add_target_id(id);
        Ok(id)
    }

    /// Make this node a build target, same as `add_target_id`.
    pub fn be_target(&self, id: FileId) {
        self.add_target_id(id);
    }

    pub fn add_target_id(&self, id: FileId) {
        let mut inner = self.lock_inner();
        if inner.target_set.insert(id) {
            inner.targets.push(id);
        } else {
            drop(inner);
            self.progress
                .warn("this target has already been added before.");
        }
    }

    /// When a lone object is requested as a target, the libraries that
    /// archive it should rebuild too.
    pub fn add_object_user_targets(&self, id: FileId) {
        let libs: Vec<FileId> = {
            let inner = self.lock_inner();
            let Some(ext) = inner.graph.node(id).as_obj() else {
                return;
            };
            let users = ext.users.clone();
            let mut libs = Vec::new();
            let mut seen = HashSet::new();
            inner.graph.visit_deps(&users, &mut seen, &mut |g, d| {
                if g.node(d).kind == FileKind::Lib {
                    libs.push(d);
                }
            });
            libs
        };
        for lib in libs {
            self.add_target_id(lib);
        }
    }

    pub fn register_target_install(&self, id: FileId, dst: &str, mode: CopyMode) {
        let mut inner = self.lock_inner();
        let dst = canon::absolute_path(dst, &inner.cwd);
        let file = inner.graph.node(id).file.clone();
        inner.installs.entry(file).or_default().push((dst, mode));
    }

    pub fn register_target_install_name(
        &self,
        name: &str,
        dst: &str,
        mode: CopyMode,
    ) -> anyhow::Result<()> {
        let Some(id) = self.find_target(name) else {
            bail!("install failed, can't find the target({})", name);
        };
        self.register_target_install(id, dst, mode);
        Ok(())
    }

    /// All registered nodes under `dir`, optionally restricted by kind.
    /// Matches both registry keys and build-tree artifact paths, so objects
    /// are found by their build location too.
    pub fn list_targets(&self, dir: &str, kind: Option<FileKind>) -> Vec<FileId> {
        let inner = self.lock_inner();
        let mut prefix = self.paths.inner_path(dir, &inner.cwd);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let build_prefix = self.paths.build_path(&prefix, &inner.cwd);
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for (key, &id) in inner.graph.by_key.iter() {
            let node = inner.graph.node(id);
            if let Some(kind) = kind {
                if node.kind != kind {
                    continue;
                }
            }
            if !key.starts_with(&prefix) && !node.file.starts_with(&build_prefix) {
                continue;
            }
            if seen.insert(id) {
                result.push(id);
            }
        }
        result
    }

    pub fn node_kind(&self, id: FileId) -> FileKind {
        self.lock_inner().graph.node(id).kind
    }

    pub fn node_key(&self, id: FileId) -> String {
        self.lock_inner().graph.node(id).key.clone()
    }

    pub fn artifact_path(&self, id: FileId) -> String {
        self.lock_inner().graph.node(id).file.clone()
    }

    /// Whether the last `build_all` actually ran work for this node.
    pub fn was_built(&self, id: FileId) -> bool {
        self.lock_inner().graph.node(id).has_been_built
    }

    fn run_runners(&self, slot: &Mutex<Vec<Runner>>) -> anyhow::Result<()> {
        let mut finished = Vec::new();
        loop {
            let mut taken = std::mem::take(&mut *slot.lock().unwrap());
            if taken.is_empty() {
                break;
            }
            for runner in &mut taken {
                runner(self)?;
            }
            finished.append(&mut taken);
        }
        *slot.lock().unwrap() = finished;
        Ok(())
    }

    /// Build the requested targets (or, with none requested, every library
    /// and binary).  Runs pre-build runners, builds with `jobs` workers
    /// (`Some(1)` builds serially in-thread), runs post-build runners, then
    /// refreshes the content-hash cache and optionally the library export.
    pub fn build_all(&self, export_libs: bool, jobs: Option<usize>) -> anyhow::Result<()> {
        self.run_runners(&self.runners_before)?;

        let targets: Vec<FileId> = {
            let inner = self.lock_inner();
            if inner.targets.is_empty() {
                let mut seen = HashSet::new();
                inner
                    .graph
                    .by_key
                    .values()
                    .copied()
                    .filter(|&id| {
                        matches!(
                            inner.graph.node(id).kind,
                            FileKind::Lib | FileKind::Binary
                        ) && seen.insert(id)
                    })
                    .collect()
            } else {
                inner.targets.clone()
            }
        };

        let builder = Builder::new(self);
        match jobs {
            Some(1) => {
                for &target in &targets {
                    builder.build(target)?;
                }
            }
            _ => {
                let workers = match jobs {
                    Some(n) if n > 1 => n,
                    _ => crate::pool::default_parallelism(),
                };
                build_parallel(&builder, &targets, workers);
            }
        }

        self.run_runners(&self.runners_after)?;

        // Hash every file reachable from the targets so the next run can
        // tell touched from changed.
        let files: Vec<String> = {
            let inner = self.lock_inner();
            let mut seen = HashSet::new();
            let mut files = Vec::new();
            inner.graph.visit_deps(&targets, &mut seen, &mut |g, d| {
                let file = &g.node(d).file;
                if !file.is_empty() {
                    files.push(file.clone());
                }
            });
            files
        };
        for file in files {
            if Path::new(&file).exists() {
                self.hashes.record(&file)?;
            }
        }
        std::fs::create_dir_all(self.paths.build_root.trim_end_matches('/'))
            .with_context(|| format!("create {}", self.paths.build_root))?;
        self.hashes
            .persist(Path::new(&format!("{}BUILD.md5s", self.paths.build_root)))?;

        if export_libs {
            self.export_libs()?;
        }
        Ok(())
    }

    /// Write the `BUILD.libs` table so another project can import this one.
    fn export_libs(&self) -> anyhow::Result<()> {
        let lib_ids = self.list_targets("/", Some(FileKind::Lib));
        let mut own = Vec::new();
        let mut imported = Vec::new();
        let mut uniq_imported = HashSet::new();
        for id in lib_ids {
            let (key, file, deps) = {
                let inner = self.lock_inner();
                let node = inner.graph.node(id);
                (node.key.clone(), node.file.clone(), node.deps.clone())
            };
            if !canon::dir_name(&file).starts_with(&self.paths.build_root) {
                self.progress.warn(&format!(
                    "this lib target({}) is out of build root dir({})",
                    file, self.paths.build_root
                ));
                continue;
            }
            let incs = {
                let mut inner = self.lock_inner();
                compose::lib_include_dirs(&mut inner, &self.paths, id)
            };
            let mut dep_names = Vec::new();
            let mut uniq_deps = HashSet::new();
            for dep in deps {
                let is_lib = {
                    let inner = self.lock_inner();
                    inner.graph.node(dep).kind == FileKind::Lib
                };
                if !is_lib {
                    continue;
                }
                let (name, dep_file) = {
                    let inner = self.lock_inner();
                    let node = inner.graph.node(dep);
                    (node.name.clone(), node.file.clone())
                };
                let dep_name = if name.starts_with('@') {
                    if uniq_imported.insert(name.clone()) {
                        let dep_incs = {
                            let mut inner = self.lock_inner();
                            compose::lib_include_dirs(&mut inner, &self.paths, dep)
                        };
                        imported.push(db::LibRow {
                            name: name.clone(),
                            inc_dirs: dep_incs,
                            file: dep_file,
                            deps: None,
                        });
                    }
                    format!("{}/", name.split('/').next().unwrap_or(&name))
                } else {
                    name
                };
                if uniq_deps.insert(dep_name.clone()) {
                    dep_names.push(dep_name);
                }
            }
            own.push(db::LibRow {
                name: key,
                inc_dirs: incs,
                file,
                deps: Some(dep_names),
            });
        }
        let table = db::render_libs_table(&own, &imported);
        let path = format!("{}BUILD.libs", self.paths.build_root);
        std::fs::write(&path, table).with_context(|| format!("write {}", path))
    }

    /// Copy or symlink every registered install target to its destinations.
    pub fn install_all(&self) -> anyhow::Result<()> {
        let installs = self.lock_inner().installs.clone();
        for (artifact, dsts) in installs {
            for (dst, mode) in dsts {
                match mode {
                    CopyMode::CreateSymlink => {
                        let _ = std::fs::remove_file(&dst);
                        std::os::unix::fs::symlink(&artifact, &dst)
                            .with_context(|| format!("symlink {} -> {}", dst, artifact))?;
                    }
                    CopyMode::OverwriteExisting => {
                        std::fs::copy(&artifact, &dst)
                            .with_context(|| format!("install {} -> {}", artifact, dst))?;
                    }
                }
            }
        }
        Ok(())
    }
}
