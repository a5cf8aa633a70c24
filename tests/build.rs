//! End-to-end scenarios driving the engine against temporary project trees.
//! Generated-file targets use shell commands like `touch` and `cp` so the
//! scenarios exercise the full build pipeline without needing a compiler.

use zmake::engine::DefaultConfig;
use zmake::{CopyMode, Engine, FileKind};

/// Manages a temporary project directory.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    fn write(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn engine(&self) -> anyhow::Result<Engine> {
        Engine::with_root(self.dir.path())
    }
}

fn mtime_of(path: &str) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn object_and_static_lib_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.cpp", "int f() { return 1; }\n")?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();
    let build = engine.build_root().to_string();

    let obj = engine.access_object("a.cpp", None)?;
    let lib = engine.access_library("a", true)?;
    engine.add_obj(lib, obj)?;

    let obj_cmd = engine.get_full_command(obj, false)?;
    assert_eq!(
        obj_cmd,
        format!(
            "g++ -c -o {b}a.o -MD -MF {b}a.o.d -idirafter {r} -idirafter {b} {r}a.cpp",
            b = build,
            r = root
        )
    );

    let lib_cmd = engine.get_full_command(lib, false)?;
    assert_eq!(lib_cmd, format!("ar crs {b}liba.a {b}a.o", b = build));
    Ok(())
}

#[test]
fn shared_lib_objects_get_pic() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.cpp", "")?;
    let engine = space.engine()?;
    let obj = engine.access_object("a.cpp", None)?;
    let shared = engine.access_library("dyn", false)?;
    engine.add_obj(shared, obj)?;
    let cmd = engine.get_full_command(obj, false)?;
    assert!(cmd.contains("-fPIC"), "expected -fPIC in {:?}", cmd);
    let lib_cmd = engine.get_full_command(shared, false)?;
    assert!(lib_cmd.starts_with("g++ -shared -o "), "got {:?}", lib_cmd);
    Ok(())
}

#[test]
fn binary_links_internal_libs_in_reverse_dependency_order() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;

    let util = engine.access_library("util", true)?;
    let net = engine.access_library("net", true)?;
    let log = engine.access_library("log", true)?;
    engine.add_dep(net, util)?;
    engine.add_dep(log, util)?;

    let srv = engine.access_binary("srv")?;
    engine.add_lib(srv, net, false)?;
    engine.add_lib(srv, log, false)?;

    // The composer only links archives that exist on disk.
    for &lib in &[util, net, log] {
        std::fs::write(engine.artifact_path(lib), "archive")?;
    }

    let cmd = engine.get_full_command(srv, false)?;
    let pos = |id| {
        let file = engine.artifact_path(id);
        cmd.find(&file)
            .unwrap_or_else(|| panic!("{} missing from {:?}", file, cmd))
    };
    assert!(pos(net) < pos(util));
    assert!(pos(log) < pos(util));
    let util_file = engine.artifact_path(util);
    assert_eq!(cmd.matches(&util_file).count(), 1, "{:?}", cmd);
    Ok(())
}

#[test]
fn whole_archive_wrapping_and_link_dirs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let core = engine.access_library("core", true)?;
    let bin = engine.access_binary("app")?;
    engine.add_lib(bin, core, true)?;
    engine.add_link_dir(bin, "extra")?;
    let cmd = engine.get_full_command(bin, false)?;
    assert!(
        cmd.contains(&format!(
            "-Wl,--whole-archive {} -Wl,--no-whole-archive",
            engine.artifact_path(core)
        )),
        "got {:?}",
        cmd
    );
    assert!(cmd.contains(&format!("-L{}extra", engine.project_root())));

    // Whole-archive linking requires a static library.
    let dynlib = engine.access_library("dynlib", false)?;
    assert!(engine.add_lib(bin, dynlib, true).is_err());
    Ok(())
}

#[test]
fn external_packages_group_on_the_link_line() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("third/include/keep", "")?;
    space.write("third/lib/libboost_a.a", "archive")?;
    space.write("third/lib/libboost_b.a", "archive")?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();

    let libs = engine.import_libraries("boost", &format!("{}third", root))?;
    assert_eq!(libs.len(), 2);

    let bin = engine.access_binary("app")?;
    engine.add_dep_libs(bin, &["@boost/*"])?;
    let cmd = engine.get_full_command(bin, false)?;
    assert!(cmd.contains(" -Wl,\"-(\" "), "got {:?}", cmd);
    assert!(cmd.contains(" -Wl,\"-)\""), "got {:?}", cmd);
    assert!(cmd.contains("libboost_a.a"));
    assert!(cmd.contains("libboost_b.a"));
    Ok(())
}

#[test]
fn import_libraries_prefers_static_and_aliases_single_lib() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("curl/include/curl.h", "")?;
    space.write("curl/lib/libcurl.a", "archive")?;
    space.write("curl/lib/libcurl.so", "shared")?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();

    let libs = engine.import_libraries("curl", &format!("{}curl", root))?;
    assert_eq!(libs.len(), 1);
    assert!(engine.artifact_path(libs[0]).ends_with("libcurl.a"));
    // A single-library package answers to the bare package name too.
    let bin = engine.access_binary("app")?;
    engine.add_dep_libs(bin, &["@curl"])?;
    Ok(())
}

#[test]
fn external_library_must_be_imported_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let err = engine.access_library("@gflags", true).unwrap_err();
    assert!(
        err.to_string().contains("must be imported first"),
        "got {}",
        err
    );
    Ok(())
}

#[test]
fn library_named_after_its_directory_is_aliased() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    std::fs::create_dir_all(space.dir.path().join("hash"))?;
    let engine = space.engine()?;
    let a = engine.access_library("/hash", true)?;
    // From inside hash/, the bare name formalizes to "/hash/hash"; both
    // spellings must address the same node.
    engine.set_rule_dir("hash")?;
    let b = engine.access_library("hash", true)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn cycle_detection_names_the_edge() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let a = engine.access_file("a.bin", true, None)?;
    let b = engine.access_file("b.bin", true, None)?;
    engine.add_dep(a, b)?;
    let err = engine.add_dep(b, a).unwrap_err();
    assert!(
        err.to_string().contains("circular dependency"),
        "got {}",
        err
    );
    assert!(err.to_string().contains("a.bin"), "got {}", err);
    Ok(())
}

#[test]
fn generated_target_builds_then_noops() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let register = |engine: &Engine| -> anyhow::Result<zmake::FileId> {
        let out = engine.access_file("out.txt", true, None)?;
        engine.set_generator(out, "touch ${1}");
        engine.add_target_id(out);
        Ok(out)
    };

    let engine = space.engine()?;
    let out = register(&engine)?;
    engine.build_all(false, Some(1))?;
    assert!(engine.was_built(out));
    let artifact = engine.artifact_path(out);
    assert!(std::path::Path::new(&artifact).exists());
    // The exact command is recorded next to the artifact.
    let recorded = std::fs::read_to_string(format!("{}.cmd", artifact))?;
    assert_eq!(recorded, format!("touch {}", artifact));
    let first_mtime = mtime_of(&artifact);

    // A fresh engine over the same tree finds nothing to do.
    let engine = space.engine()?;
    let out = register(&engine)?;
    engine.build_all(false, Some(1))?;
    assert!(!engine.was_built(out));
    assert_eq!(mtime_of(&artifact), first_mtime);
    Ok(())
}

#[test]
fn changed_command_forces_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    {
        let engine = space.engine()?;
        let out = engine.access_file("gen.txt", true, None)?;
        engine.set_generator(out, "touch ${1}");
        engine.add_target_id(out);
        engine.build_all(false, Some(1))?;
        assert!(engine.was_built(out));
    }
    {
        let engine = space.engine()?;
        let out = engine.access_file("gen.txt", true, None)?;
        engine.set_generator(out, "echo changed > ${1}");
        engine.add_target_id(out);
        engine.build_all(false, Some(1))?;
        assert!(engine.was_built(out));
        let content = std::fs::read_to_string(engine.artifact_path(out))?;
        assert_eq!(content.trim(), "changed");
    }
    Ok(())
}

#[test]
fn touched_dep_with_same_content_does_not_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("conf.h", "#define X 1\n")?;
    let register = |engine: &Engine| -> anyhow::Result<zmake::FileId> {
        let input = engine.access_file("conf.h", false, None)?;
        let out = engine.access_file("out.txt", true, None)?;
        let in_path = engine.artifact_path(input);
        engine.set_generator(out, &format!("cp {} ${{1}}", in_path));
        engine.add_dep(out, input)?;
        engine.add_target_id(out);
        Ok(out)
    };

    let engine = space.engine()?;
    let out = register(&engine)?;
    engine.build_all(false, Some(1))?;
    assert!(engine.was_built(out));

    // Touch: newer mtime, same bytes.  The hash cache knows better.
    space.write("conf.h", "#define X 1\n")?;
    let engine = space.engine()?;
    let out = register(&engine)?;
    engine.build_all(false, Some(1))?;
    assert!(!engine.was_built(out));

    // A real content change rebuilds.
    space.write("conf.h", "#define X 2\n")?;
    let engine = space.engine()?;
    let out = register(&engine)?;
    engine.build_all(false, Some(1))?;
    assert!(engine.was_built(out));
    Ok(())
}

#[test]
fn diamond_dependency_runs_each_command_once() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();

    let target = |name: &str, extra: &str| -> anyhow::Result<zmake::FileId> {
        let id = engine.access_file(name, true, None)?;
        engine.set_generator(id, &format!("{}touch ${{1}}", extra));
        Ok(id)
    };
    let d = target("d.txt", &format!("echo ran >> {}d.log && ", root))?;
    let b = target("b.txt", "")?;
    let c = target("c.txt", "")?;
    let a = target("a.txt", "")?;
    engine.add_dep(a, b)?;
    engine.add_dep(a, c)?;
    engine.add_dep(b, d)?;
    engine.add_dep(c, d)?;
    engine.add_target_id(a);

    engine.build_all(false, None)?;
    let log = std::fs::read_to_string(format!("{}d.log", root))?;
    assert_eq!(log.lines().count(), 1, "log: {:?}", log);
    for id in [a, b, c, d] {
        assert!(std::path::Path::new(&engine.artifact_path(id)).exists());
    }
    Ok(())
}

#[test]
fn install_copies_and_symlinks() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();
    std::fs::create_dir_all(format!("{}dist", root))?;

    let out = engine.access_file("tool.txt", true, None)?;
    engine.set_generator(out, "echo tool > ${1}");
    engine.add_target_id(out);
    engine.register_target_install(out, "dist/tool.txt", CopyMode::OverwriteExisting);
    engine.register_target_install(out, "dist/tool.link", CopyMode::CreateSymlink);

    engine.build_all(false, Some(1))?;
    engine.install_all()?;

    let copied = std::fs::read_to_string(format!("{}dist/tool.txt", root))?;
    assert_eq!(copied.trim(), "tool");
    let meta = std::fs::symlink_metadata(format!("{}dist/tool.link", root))?;
    assert!(meta.file_type().is_symlink());
    Ok(())
}

#[test]
fn dep_libs_directory_reference_resolves_before_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;

    let bin = engine.access_binary("app")?;
    engine.set_full_command(bin, "true");
    engine.add_target_id(bin);
    // Referenced before any library exists under /svc; resolution happens
    // at build time.
    engine.add_dep_libs(bin, &["/svc/"])?;

    let anchor = engine.access_file("anchor.txt", true, None)?;
    engine.set_generator(anchor, "touch ${1}");
    let lib = engine.access_library("/svc/logic", true)?;
    engine.add_dep(lib, anchor)?;

    engine.build_all(false, Some(1))?;
    let deps = engine.dump_deps(bin);
    assert!(deps.contains("liblogic.a"), "deps: {}", deps);
    Ok(())
}

#[test]
fn proto_spawns_generated_object_and_protoc_line() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("proto/a.proto", "syntax = \"proto3\";\n")?;
    let engine = space.engine()?;
    let root = engine.project_root().to_string();
    let build = engine.build_root().to_string();

    engine.set_rule_dir("proto")?;
    let lib = engine.access_library("pb", true)?;
    engine.add_proto(lib, "a.proto")?;

    let proto = engine.access_proto("a.proto")?;
    let cmd = engine.get_full_command(proto, false)?;
    assert_eq!(
        cmd,
        format!(
            "protoc --cpp_out={b} -I{r} -I{r2}proto {r}proto/a.proto",
            b = build,
            r = root,
            r2 = root
        )
    );

    // The generated pair exists in the registry as generated-by-dep files.
    let hdr = engine.find_target(&format!("{}proto/a.pb.h", build));
    let src = engine.find_target(&format!("{}proto/a.pb.cc", build));
    assert!(hdr.is_some() && src.is_some());

    // The archive includes the spawned object.
    let lib_cmd = engine.get_full_command(lib, false)?;
    assert!(
        lib_cmd.contains(&format!("{}proto/a.pb.o", build)),
        "got {:?}",
        lib_cmd
    );
    Ok(())
}

#[test]
fn export_then_import_between_projects() -> anyhow::Result<()> {
    let provider = TestSpace::new()?;
    {
        let engine = provider.engine()?;
        let anchor = engine.access_file("anchor.txt", true, None)?;
        engine.set_generator(anchor, "touch ${1}");
        let lib = engine.access_library("core", true)?;
        engine.add_dep(lib, anchor)?;
        engine.add_target_id(lib);
        engine.build_all(true, Some(1))?;
        assert!(
            std::path::Path::new(&format!("{}BUILD.libs", engine.build_root())).exists()
        );
    }

    let consumer = TestSpace::new()?;
    let engine = consumer.engine()?;
    engine.import_external_project("prj", provider.dir.path().to_str().unwrap())?;
    let imported = engine.find_target("@prj/core").expect("imported library");
    assert_eq!(engine.node_kind(imported), FileKind::Lib);

    let bin = engine.access_binary("app")?;
    engine.add_dep_libs(bin, &["@prj/core"])?;
    Ok(())
}

#[test]
fn global_opt_override_applies_to_composed_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.cpp", "")?;
    let engine = space.engine()?;
    engine.set_default_flags(DefaultConfig::Object, &["-O2"]);
    engine.set_opt_override(0);
    let obj = engine.access_object("a.cpp", None)?;
    let cmd = engine.get_full_command(obj, false)?;
    assert!(cmd.contains(" -O0"), "got {:?}", cmd);
    assert!(!cmd.contains(" -O2"), "got {:?}", cmd);
    Ok(())
}

#[test]
fn run_impl_lists_and_analyzes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    let mut rules = zmake::run::Rules::new();
    rules.add(".", |engine: &Engine| {
        let anchor = engine.access_file("anchor.txt", true, None)?;
        engine.set_generator(anchor, "touch ${1}");
        let lib = engine.access_library("core", true)?;
        engine.add_dep(lib, anchor)?;
        Ok(())
    });

    let opts = |list: Option<&str>, analyze: Option<&str>| zmake::run::Opts {
        verbose: false,
        debug: None,
        debug_symbols: false,
        opt_level: None,
        export_libs: false,
        jobs: Some(1),
        targets: None,
        analyze: analyze.map(|s| s.to_string()),
        build_under: None,
        build_under_compat: None,
        list: list.map(|s| s.to_string()),
    };

    assert_eq!(zmake::run::run_impl(&engine, &rules, opts(Some("."), None))?, 0);
    assert_eq!(
        zmake::run::run_impl(&engine, &rules, opts(None, Some("/core")))?,
        0
    );
    assert_eq!(
        zmake::run::run_impl(&engine, &rules, opts(None, Some("/missing")))?,
        1
    );
    Ok(())
}
