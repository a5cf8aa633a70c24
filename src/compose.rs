//! Derives the shell command for each node kind.
//!
//! Composition happens once per node (the cached command wins on later
//! calls) after its deps have been built, so library artifacts referenced by
//! a link line already exist.  The global `-O` override is re-applied on
//! every call; it is idempotent on an already-rewritten command.

use crate::canon::{self, ProjectPaths};
use crate::engine::Inner;
use crate::graph::{
    extension, has_suffix, FileId, FileKind, NodeExt, ObjExt, HEADER_SUFFIXES,
};
use crate::progress::Progress;
use anyhow::bail;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Compose `id`'s command if it has none yet.  Returns false when the node
/// needs no build step at all (plain headers, dependency-aggregating
/// libraries); such nodes are marked done.
pub(crate) fn compose_command(
    inner: &mut Inner,
    paths: &ProjectPaths,
    opt: Option<i32>,
    progress: &Progress,
    id: FileId,
) -> anyhow::Result<bool> {
    match &inner.graph.node(id).ext {
        NodeExt::Obj(_) => compose_obj(inner, paths, opt, id),
        NodeExt::Lib(_) => compose_lib(inner, opt, id),
        NodeExt::Bin(_) => compose_bin(inner, opt, id),
        NodeExt::Proto(_) => compose_proto(inner, paths, id),
        NodeExt::None => compose_file(inner, progress, id),
    }
}

/// Rewrite the first `-O<level>` in `cmd` with the override level and drop
/// any later ones.  When no `-O` is present a nonzero override is appended.
pub fn update_optimization_level(cmd: &mut String, opt: Option<i32>) {
    let Some(level) = opt else {
        return;
    };
    let mut pos = 0;
    let mut replaced = false;
    loop {
        let Some(found) = cmd[pos..].find(" -O") else {
            if !replaced && level != 0 {
                cmd.push_str(&format!(" -O{}", level));
            }
            return;
        };
        let p = pos + found;
        let val_start = p + 3;
        let val_end = cmd[val_start..]
            .find(' ')
            .map(|x| val_start + x)
            .unwrap_or(cmd.len());
        match &cmd[val_start..val_end] {
            "" | "0" | "1" | "2" | "3" | "g" | "s" | "fast" => {
                if !replaced {
                    cmd.replace_range(p..val_end, &format!(" -O{}", level));
                    replaced = true;
                    pos = p + 3;
                } else {
                    cmd.replace_range(p..val_end, "");
                    pos = p;
                }
            }
            _ => pos = val_start,
        }
    }
}

fn push_conf(cmd: &mut String, conf: String) {
    if !conf.is_empty() {
        cmd.push(' ');
        cmd.push_str(&conf);
    }
}

/// Record an include directory on an object, normalized with a trailing
/// slash, ignoring duplicates.  `dir` must be absolute.
pub(crate) fn obj_add_include_dir(obj: &mut ObjExt, dir: &str) {
    if dir.is_empty() {
        return;
    }
    let mut inc = canon::canon_path(dir);
    if !inc.ends_with('/') {
        inc.push('/');
    }
    if obj.uniq_inc_dirs.insert(inc.clone()) {
        obj.inc_dirs.push(inc);
    }
}

/// The include directories a library exposes to code that links it.  When
/// the library never declared any, a sensible default is chosen lazily: the
/// build root for a purely protobuf-generated library (users include the
/// generated headers), otherwise the library's own directory.
pub(crate) fn lib_include_dirs(inner: &mut Inner, paths: &ProjectPaths, id: FileId) -> Vec<String> {
    let node = inner.graph.node(id);
    let lib = node.as_lib().expect("library node");
    if lib.inc_dirs.is_empty() {
        let all_generated = !lib.objs.is_empty()
            && lib.objs.iter().all(|&o| {
                inner
                    .graph
                    .node(o)
                    .as_obj()
                    .map(|e| e.src.ends_with(".pb.cc"))
                    .unwrap_or(false)
            });
        let dir = if all_generated {
            paths.build_root.clone()
        } else {
            node.cwd.clone()
        };
        inner
            .graph
            .node_mut(id)
            .as_lib_mut()
            .unwrap()
            .inc_dirs
            .insert(dir);
    }
    inner
        .graph
        .node(id)
        .as_lib()
        .unwrap()
        .inc_dirs
        .iter()
        .cloned()
        .collect()
}

fn compose_file(inner: &mut Inner, progress: &Progress, id: FileId) -> anyhow::Result<bool> {
    let node = inner.graph.node(id);
    if node.cmd.is_none() && !node.generated_by_dep {
        let file = node.file.clone();
        if let Some(generator) = &node.generator {
            let cmd = generator.generate(&[&file])?;
            inner.graph.node_mut(id).cmd = Some(cmd);
        } else if let Some(generator) = inner.generators.get(extension(&file)) {
            let cmd = generator.generate(&[&file])?;
            inner.graph.node_mut(id).cmd = Some(cmd);
        } else if has_suffix(&file, HEADER_SUFFIXES) {
            let node = inner.graph.node_mut(id);
            node.kind = FileKind::Header;
            node.build_done = true;
            return Ok(false);
        } else {
            progress.warn(&format!("no need to build this file({})", file));
            inner.graph.node_mut(id).build_done = true;
            return Ok(false);
        }
    }
    let node = inner.graph.node(id);
    Ok(node.cmd.is_some() || node.generated_by_dep)
}

fn compose_obj(
    inner: &mut Inner,
    paths: &ProjectPaths,
    opt: Option<i32>,
    id: FileId,
) -> anyhow::Result<bool> {
    if inner.graph.node(id).cmd.is_none() {
        let (deps, users) = {
            let node = inner.graph.node(id);
            let obj = node.as_obj().expect("object node");
            (node.deps.clone(), obj.users.clone())
        };

        // The project root always works as an include path, so users can
        // write project-rooted includes.
        obj_add_include_dir(
            inner.graph.node_mut(id).as_obj_mut().unwrap(),
            &paths.root,
        );

        // Every library reachable from this object's deps, or from the
        // libraries/binaries that consume it, contributes its exposed
        // include directories.
        let mut seen = HashSet::new();
        let mut libs = Vec::new();
        let mut collect = |g: &crate::graph::Graph, d: FileId| {
            if g.node(d).kind == FileKind::Lib {
                libs.push(d);
            }
        };
        inner.graph.visit_deps(&deps, &mut seen, &mut collect);
        inner.graph.visit_deps(&users, &mut seen, &mut collect);
        for lib in libs {
            for inc in lib_include_dirs(inner, paths, lib) {
                obj_add_include_dir(inner.graph.node_mut(id).as_obj_mut().unwrap(), &inc);
            }
        }

        let node = inner.graph.node(id);
        let obj = node.as_obj().unwrap();
        let mut cmd = format!(
            "{} -c -o {} -MD -MF {}.d",
            node.compiler, node.file, node.file
        );
        for inc in &obj.inc_dirs {
            cmd.push_str(&format!(" -idirafter {}", inc));
        }
        let conf = match &node.config {
            Some(conf) => conf.to_string_with(Some(&inner.defaults.object)),
            None => inner.defaults.object.to_string_with(None),
        };
        push_conf(&mut cmd, conf);
        cmd.push_str(&format!(" {}", obj.src));
        inner.graph.node_mut(id).cmd = Some(cmd);
    }

    let mut cmd = inner.graph.node_mut(id).cmd.take().unwrap();
    update_optimization_level(&mut cmd, opt);
    inner.graph.node_mut(id).cmd = Some(cmd);
    Ok(true)
}

fn compose_lib(inner: &mut Inner, opt: Option<i32>, id: FileId) -> anyhow::Result<bool> {
    let is_static = inner
        .graph
        .node(id)
        .as_lib()
        .expect("library node")
        .is_static;
    if inner.graph.node(id).cmd.is_none() {
        let (name, objs, libs, wa_libs) = {
            let node = inner.graph.node(id);
            let lib = node.as_lib().unwrap();
            (
                node.name.clone(),
                lib.objs.clone(),
                lib.libs.clone(),
                lib.whole_archive_libs.clone(),
            )
        };
        if is_static && objs.is_empty() {
            if inner.graph.node(id).deps.is_empty() {
                bail!("found uninitialized library({})", name);
            }
            // A static library with deps but no objects is a pure
            // dependency aggregate; there is nothing to archive.
            inner.graph.node_mut(id).build_done = true;
            return Ok(false);
        }

        let node = inner.graph.node(id);
        let mut cmd = if is_static {
            node.file.clone()
        } else {
            format!("{} -shared -o {}", node.compiler, node.file)
        };
        for &obj in &objs {
            cmd.push_str(&format!(" {}", inner.graph.node(obj).file));
        }
        for &lib in &libs {
            let dep = inner.graph.node(lib);
            if dep.as_lib().map(|l| l.whole_archive).unwrap_or(false) {
                cmd.push_str(&format!(
                    " -Wl,--whole-archive {} -Wl,--no-whole-archive",
                    dep.file
                ));
            } else {
                cmd.push_str(&format!(" {}", dep.file));
            }
        }
        if !wa_libs.is_empty() {
            cmd.push_str(" -Wl,--whole-archive");
            for &lib in &wa_libs {
                cmd.push_str(&format!(" {}", inner.graph.node(lib).file));
            }
            cmd.push_str(" -Wl,--no-whole-archive");
        }

        let node = inner.graph.node(id);
        let cmd = if is_static {
            let conf = match &node.config {
                Some(conf) => conf.to_string_with(Some(&inner.defaults.static_lib)),
                None => inner.defaults.static_lib.to_string_with(None),
            };
            let mut head = node.compiler.clone();
            push_conf(&mut head, conf);
            format!("{} {}", head, cmd)
        } else {
            let conf = match &node.config {
                Some(conf) => conf.to_string_with(Some(&inner.defaults.shared_lib)),
                None => inner.defaults.shared_lib.to_string_with(None),
            };
            let mut cmd = cmd;
            push_conf(&mut cmd, conf);
            cmd
        };
        inner.graph.node_mut(id).cmd = Some(cmd);
    }

    if !is_static {
        let mut cmd = inner.graph.node_mut(id).cmd.take().unwrap();
        update_optimization_level(&mut cmd, opt);
        inner.graph.node_mut(id).cmd = Some(cmd);
    }
    Ok(true)
}

fn compose_bin(inner: &mut Inner, opt: Option<i32>, id: FileId) -> anyhow::Result<bool> {
    if inner.graph.node(id).cmd.is_none() {
        let (deps, objs, libs, wa_libs, link_dirs) = {
            let node = inner.graph.node(id);
            let bin = node.as_bin().expect("binary node");
            (
                node.deps.clone(),
                bin.objs.clone(),
                bin.libs.clone(),
                bin.whole_archive_libs.clone(),
                bin.link_dirs.clone(),
            )
        };
        let node = inner.graph.node(id);
        let mut cmd = format!("{} -o {}", node.compiler, node.file);
        let mut conf = node.config.clone().unwrap_or_default();
        for &obj in &objs {
            cmd.push_str(&format!(" {}", inner.graph.node(obj).file));
        }

        let mut seen: HashSet<FileId> = wa_libs.iter().copied().collect();
        if !wa_libs.is_empty() {
            cmd.push_str(" -Wl,--whole-archive");
            for &lib in &wa_libs {
                if let Some(ext) = inner.graph.node(lib).as_lib() {
                    conf.merge(&ext.link_conf, false);
                }
                cmd.push_str(&format!(" {}", inner.graph.node(lib).file));
            }
            cmd.push_str(" -Wl,--no-whole-archive");
        }

        for dir in &link_dirs {
            cmd.push_str(&format!(" -L{}", dir));
        }

        // Collect every already-built library reachable from the binary.
        // Internal libraries link in reverse dependency order (GNU ld
        // resolves left to right); external packages group together so
        // mutually-referencing archives can resolve.
        let mut internal = Vec::new();
        let mut pkgs: Vec<String> = Vec::new();
        let mut external: HashMap<String, Vec<FileId>> = HashMap::new();
        {
            let mut handle = |g: &crate::graph::Graph, d: FileId| {
                let node = g.node(d);
                if node.kind != FileKind::Lib || !Path::new(&node.file).exists() {
                    return;
                }
                if node.name.starts_with('@') {
                    let pkg = node.name.split('/').next().unwrap_or("").to_string();
                    if !external.contains_key(&pkg) {
                        pkgs.push(pkg.clone());
                    }
                    external.entry(pkg).or_default().push(d);
                } else {
                    internal.push(d);
                }
            };
            inner.graph.visit_deps(&libs, &mut seen, &mut handle);
            for &wl in &wa_libs {
                let wdeps = inner.graph.node(wl).deps.clone();
                inner.graph.visit_deps(&wdeps, &mut seen, &mut handle);
            }
            inner.graph.visit_deps(&deps, &mut seen, &mut handle);
        }

        let mut emit = |inner: &Inner, conf: &mut crate::config::Config, cmd: &mut String, d: FileId| {
            let node = inner.graph.node(d);
            let lib = node.as_lib().expect("library node");
            conf.merge(&lib.link_conf, false);
            if lib.is_static {
                if lib.whole_archive {
                    cmd.push_str(&format!(
                        " -Wl,--whole-archive {} -Wl,--no-whole-archive",
                        node.file
                    ));
                } else {
                    cmd.push_str(&format!(" {}", node.file));
                }
            } else {
                let dir = canon::dir_name(&node.file);
                let mut stem = canon::file_name(&node.file).to_string();
                for suffix in [".a", ".so"] {
                    if let Some(s) = stem.strip_suffix(suffix) {
                        stem = s.to_string();
                        break;
                    }
                }
                if let Some(s) = stem.strip_prefix("lib") {
                    stem = s.to_string();
                }
                cmd.push_str(&format!(" -L{} -l{}", dir.trim_end_matches('/'), stem));
            }
        };

        for &lib in internal.iter().rev() {
            emit(inner, &mut conf, &mut cmd, lib);
        }
        for pkg in pkgs.iter().rev() {
            let libs = &external[pkg];
            if libs.len() > 1 {
                cmd.push_str(" -Wl,\"-(\"");
            }
            for &lib in libs {
                emit(inner, &mut conf, &mut cmd, lib);
            }
            if libs.len() > 1 {
                cmd.push_str(" -Wl,\"-)\"");
            }
        }

        push_conf(&mut cmd, conf.to_string_with(Some(&inner.defaults.binary)));
        let node = inner.graph.node_mut(id);
        node.config = Some(conf);
        node.cmd = Some(cmd);
    }

    let mut cmd = inner.graph.node_mut(id).cmd.take().unwrap();
    update_optimization_level(&mut cmd, opt);
    inner.graph.node_mut(id).cmd = Some(cmd);
    Ok(true)
}

fn compose_proto(inner: &mut Inner, paths: &ProjectPaths, id: FileId) -> anyhow::Result<bool> {
    if inner.graph.node(id).cmd.is_none() {
        let (deps, cwd, file, compiler, import_dirs) = {
            let node = inner.graph.node(id);
            let proto = node.as_proto().expect("proto node");
            (
                node.deps.clone(),
                node.cwd.clone(),
                node.file.clone(),
                node.compiler.clone(),
                proto.import_dirs.clone(),
            )
        };
        let mut cmd = format!("{} --cpp_out={}", compiler, paths.build_root);
        // The project root import path comes first so every proto import
        // resolves project-rooted, keeping generated namespaces stable.
        let mut uniq: HashSet<String> = HashSet::new();
        cmd.push_str(&format!(" -I{}", paths.root));
        uniq.insert(paths.root.clone());
        if uniq.insert(cwd.clone()) {
            cmd.push_str(&format!(" -I{}", cwd));
        }
        let mut dep_cwds = Vec::new();
        let mut seen = HashSet::new();
        inner.graph.visit_deps(&deps, &mut seen, &mut |g, d| {
            let node = g.node(d);
            if node.kind == FileKind::Proto {
                dep_cwds.push(node.cwd.clone());
            }
        });
        for dir in dep_cwds.into_iter().chain(import_dirs) {
            if uniq.insert(dir.clone()) {
                cmd.push_str(&format!(" -I{}", dir));
            }
        }
        cmd.push_str(&format!(" {}", file));
        inner.graph.node_mut(id).cmd = Some(cmd);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_override_replaces_first_and_drops_rest() {
        let mut cmd = "g++ -c -O2 a.cpp -O3".to_string();
        update_optimization_level(&mut cmd, Some(0));
        assert_eq!(cmd, "g++ -c -O0 a.cpp");
    }

    #[test]
    fn opt_override_appends_when_absent() {
        let mut cmd = "g++ -c a.cpp".to_string();
        update_optimization_level(&mut cmd, Some(2));
        assert_eq!(cmd, "g++ -c a.cpp -O2");
        // Level 0 with nothing to replace appends nothing.
        let mut cmd = "g++ -c a.cpp".to_string();
        update_optimization_level(&mut cmd, Some(0));
        assert_eq!(cmd, "g++ -c a.cpp");
    }

    #[test]
    fn opt_override_skips_unrelated_flags() {
        let mut cmd = "g++ -Ofast -Output x".to_string();
        update_optimization_level(&mut cmd, Some(1));
        assert_eq!(cmd, "g++ -O1 -Output x");
    }

    #[test]
    fn opt_override_is_idempotent() {
        let mut cmd = "g++ -c -O2 a.cpp".to_string();
        update_optimization_level(&mut cmd, Some(3));
        update_optimization_level(&mut cmd, Some(3));
        assert_eq!(cmd, "g++ -c -O3 a.cpp");
    }

    #[test]
    fn opt_override_absent_is_noop() {
        let mut cmd = "g++ -c -O2 a.cpp".to_string();
        update_optimization_level(&mut cmd, None);
        assert_eq!(cmd, "g++ -c -O2 a.cpp");
    }
}
