//! The command-line surface of the generated build executable: the user's
//! compiled-in rule set plus the standard flags for driving a build.

use crate::engine::{DefaultConfig, Engine};
use crate::graph::{has_suffix, replace_suffix, FileKind, SOURCE_SUFFIXES};
use anyhow::Context;

pub type RuleFn = Box<dyn Fn(&Engine) -> anyhow::Result<()>>;

/// Per-directory rule functions, the compiled equivalent of one rule file
/// per project directory.  Each runs with its directory as the working
/// directory for the nodes it creates.
#[derive(Default)]
pub struct Rules {
    rules: Vec<(String, RuleFn)>,
}

impl Rules {
    pub fn new() -> Rules {
        Rules::default()
    }

    pub fn add<F>(&mut self, dir: &str, rule: F) -> &mut Rules
    where
        F: Fn(&Engine) -> anyhow::Result<()> + 'static,
    {
        self.rules.push((dir.to_string(), Box::new(rule)));
        self
    }
}

#[derive(argh::FromArgs)]
/// build the project using the compiled-in rules
pub struct Opts {
    /// show the full command of every build
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    /// debug level 1 or 2, printing rebuild reasons
    #[argh(option, short = 'd')]
    pub debug: Option<u32>,

    /// compile and link everything with -g
    #[argh(switch, short = 'g')]
    pub debug_symbols: bool,

    /// force this optimization level on every command
    #[argh(option, short = 'O')]
    pub opt_level: Option<i32>,

    /// export the library table so other projects can import this one
    #[argh(switch, short = 'e')]
    pub export_libs: bool,

    /// concurrency; 1 builds serially, default is a quarter of the cores
    #[argh(option, short = 'j')]
    pub jobs: Option<usize>,

    /// build only these targets, separated by ';'
    #[argh(option, short = 't')]
    pub targets: Option<String>,

    /// dump a target's dependency tree and exit
    #[argh(option, short = 'A')]
    pub analyze: Option<String>,

    /// build every target under this directory
    #[argh(option, short = 'b')]
    pub build_under: Option<String>,

    /// same as -b
    #[argh(option, short = 'c')]
    pub build_under_compat: Option<String>,

    /// list the targets under this directory and exit
    #[argh(option, short = 'l')]
    pub list: Option<String>,
}

/// Entry point for the generated executable.  Must be invoked from the
/// directory containing it (the project root), since every relative path in
/// the rule set is anchored there.
pub fn run(engine: &Engine, rules: &Rules) -> anyhow::Result<i32> {
    let exe = std::env::current_exe().context("current exe")?;
    let cwd = std::env::current_dir().context("current dir")?;
    let exe_dir = exe.parent().map(std::fs::canonicalize).transpose()?;
    if exe_dir.as_deref() != Some(std::fs::canonicalize(&cwd)?.as_path()) {
        engine.progress().error(
            "please run the build executable under the directory containing it",
        );
        return Ok(1);
    }
    run_impl(engine, rules, argh::from_env())
}

pub fn run_impl(engine: &Engine, rules: &Rules, opts: Opts) -> anyhow::Result<i32> {
    engine.set_verbose(opts.verbose);
    if let Some(level) = opts.debug {
        engine.set_debug_level(level);
    }
    if opts.debug_symbols {
        engine.set_default_flags(DefaultConfig::Object, &["-g"]);
        engine.set_default_flags(DefaultConfig::SharedLib, &["-g"]);
        engine.set_default_flags(DefaultConfig::Binary, &["-g"]);
    }
    if let Some(level) = opts.opt_level {
        engine.set_opt_override(level);
    }

    for (dir, rule) in &rules.rules {
        engine.set_rule_dir(dir)?;
        engine.progress().stage(&format!(
            "Start to analyze targets under the directory {}",
            dir
        ));
        rule(engine)?;
    }
    engine.set_rule_dir(&engine.project_root().to_string())?;

    if let Some(dir) = &opts.list {
        for id in engine.list_targets(dir, None) {
            if engine.node_kind(id) == FileKind::Header {
                continue;
            }
            println!(
                "target:{}, path:{}",
                engine.node_key(id),
                engine.artifact_path(id)
            );
        }
        return Ok(0);
    }

    if let Some(target) = &opts.analyze {
        let id = engine
            .find_target(target)
            .or_else(|| engine.find_target(&engine.to_build_path(target)));
        let Some(id) = id else {
            engine
                .progress()
                .error(&format!("can't find the target '{}'", target));
            return Ok(1);
        };
        print!("{}", engine.dump_deps(id));
        return Ok(0);
    }

    if let Some(targets) = &opts.targets {
        for target in targets.split(';').filter(|t| !t.is_empty()) {
            let mut id = if target.ends_with(".o") {
                engine.add_target(&engine.to_build_path(target))?
            } else {
                engine.add_target(target)?
            };
            if has_suffix(target, SOURCE_SUFFIXES) {
                let obj = replace_suffix(target, SOURCE_SUFFIXES, ".o");
                id = engine.add_target(&engine.to_build_path(&obj))?;
            }
            if engine.node_kind(id) == FileKind::Obj {
                // Rebuilding an object should also refresh the libraries
                // that archive it.
                engine.add_object_user_targets(id);
            }
        }
    }

    if let Some(dir) = opts.build_under.as_ref().or(opts.build_under_compat.as_ref()) {
        for id in engine.list_targets(dir, None) {
            engine.add_target_id(id);
        }
    }

    engine.progress().stage("Start to build all targets");
    engine.build_all(opts.export_libs, opts.jobs)?;
    engine.progress().stage("Start to install all targets");
    engine.install_all()?;
    Ok(0)
}
