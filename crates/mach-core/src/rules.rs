//! Rule Emitter (§4.5): for each unit, a rule fragment for the external build driver; for
//! the entry point, a root fragment stitching every fragment together and defining the
//! link target.
//!
//! This module is a pure function of [`GraphState`] plus a `home` directory — no
//! filesystem or process access. It only builds strings; writing them to disk is the
//! Configure Orchestrator's job.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::model::{Directive, GraphState, LibraryUnit, ModuleUnit, Unit};
use crate::paths::{build_dir_for, normalize};

/// Name of the root fragment written at the entry point's own build directory.
pub const ROOT_FRAGMENT_NAME: &str = "build.ninja";
/// Name of each unit's own fragment, written inside that unit's build directory.
pub const UNIT_FRAGMENT_NAME: &str = "module.ninja";

/// The shim subcommand every compiler invocation is routed through so the executor can
/// tell compiler diagnostics from driver chatter (§6).
const SHIM: &str = "run-build-command";

/// One unit's emitted fragment, plus the build directory it belongs in.
pub struct UnitFragment {
    pub build_dir: PathBuf,
    pub contents: String,
}

/// Emit every unit's fragment plus the root fragment for `entry_path` (§4.5).
///
/// `units_to_emit` restricts which *unit* fragments are (re)written — `None` means all of
/// them (full reconfigure); `Some(paths)` means only units whose path is in the set, plus
/// any unit whose build directory doesn't exist yet. The root fragment is always emitted
/// (§4.6 step 6).
pub fn emit(
    state: &GraphState,
    home: &Path,
    entry_path: &Path,
    runtime_self_path: &Path,
    units_to_emit: Option<&std::collections::HashSet<PathBuf>>,
    build_dir_exists: impl Fn(&Path) -> bool,
) -> Vec<UnitFragment> {
    let mut fragments = Vec::new();

    for unit in &state.units {
        let dir = build_dir_for(home, unit.path());
        let should_emit = match units_to_emit {
            None => true,
            Some(paths) => paths.contains(unit.path()) || !build_dir_exists(&dir),
        };
        if !should_emit {
            continue;
        }
        let contents = match unit {
            Unit::Module(m) => emit_module_fragment(m, home),
            Unit::Library(l) => emit_library_fragment(l, home),
        };
        fragments.push(UnitFragment {
            build_dir: dir,
            contents,
        });
    }

    let entry_dir = build_dir_for(home, entry_path);
    fragments.push(UnitFragment {
        build_dir: entry_dir,
        contents: emit_root_fragment(state, home, runtime_self_path),
    });

    fragments
}

fn dep_build_dirs<'a>(requires: impl Iterator<Item = &'a Directive>, home: &Path) -> Vec<PathBuf> {
    requires
        .filter_map(|d| d.path_target())
        .map(|p| build_dir_for(home, p))
        .collect()
}

fn includes_args_recipe(own_dir: Option<&Path>, requires: &[PathBuf]) -> String {
    let mut out = String::new();
    if let Some(own) = own_dir {
        writeln!(out, "-I={}", own.display()).unwrap();
    }
    for dir in requires {
        writeln!(out, "-I={}", dir.display()).unwrap();
    }
    out
}

/// Build the `build <includes_args>: includes_args …` rule, wiring in
/// `ext_includes.args` as both a dependency and a second recipe line when external-library
/// requires are present (§4.5 rule 2/3): the includes file must consume the package-index
/// query's output, not merely reference it.
fn write_includes_args_rule(
    out: &mut String,
    includes_args: &str,
    extra_dep: Option<&str>,
    own_dir: Option<&Path>,
    dep_dirs: &[PathBuf],
    ext_args: Option<&str>,
) {
    let mut deps = extra_dep.map(str::to_string).unwrap_or_default();
    if let Some(ext_args) = ext_args {
        if !deps.is_empty() {
            deps.push(' ');
        }
        deps.push_str(ext_args);
    }

    let heredoc = format!("cat <<'EOF' > $out\n{}EOF", includes_args_recipe(own_dir, dep_dirs));
    let command = match ext_args {
        Some(ext_args) => format!("{heredoc}\ncat {ext_args} >> $out"),
        None => heredoc,
    };

    if deps.is_empty() {
        writeln!(out, "build {includes_args}: includes_args\n  command = {command}").unwrap();
    } else {
        writeln!(out, "build {includes_args}: includes_args {deps}\n  command = {command}").unwrap();
    }
}

fn emit_module_fragment(m: &ModuleUnit, home: &Path) -> String {
    let dir = build_dir_for(home, &m.path_src);
    let dialect_ext = m.dialect.source_ext();
    let name = normalize(&m.path_src);
    let mut out = String::new();

    writeln!(out, "# module {}", m.path_src.display()).unwrap();

    // 1. preprocess rule(s). Alternate-dialect sources additionally pipe through the
    // external dialect preprocessor.
    let pp_src = format!("{}/{name}.{dialect_ext}", dir.display());
    let pp_recipe = match m.dialect {
        crate::model::Dialect::Alternate => format!("{SHIM} -- pp --pp rescript-pp -o $out $in"),
        crate::model::Dialect::Primary => format!("{SHIM} -- pp -o $out $in"),
    };
    writeln!(
        out,
        "build {pp_src}: preprocess {}\n  command = {pp_recipe}",
        m.path_src.display()
    )
    .unwrap();

    let pp_intf = m.path_intf.as_ref().map(|intf_path| {
        let intf_ext = m.dialect.intf_ext();
        let out_path = format!("{}/{name}.{intf_ext}", dir.display());
        writeln!(
            out,
            "build {out_path}: preprocess {}\n  command = {SHIM} -- pp -o $out $in",
            intf_path.display()
        )
        .unwrap();
        out_path
    });

    // 2/3. includes.args (+ ext_includes.args if externals present)
    let has_external = m
        .requires
        .iter()
        .any(|r| matches!(r.value, Directive::ExternalLib { .. }));
    let dep_dirs = dep_build_dirs(m.requires.iter().map(|r| &r.value), home);
    let includes_args = format!("{}/includes.args", dir.display());
    let ext_args = format!("{}/ext_includes.args", dir.display());
    write_includes_args_rule(
        &mut out,
        &includes_args,
        Some(&pp_src),
        None,
        &dep_dirs,
        has_external.then_some(ext_args.as_str()),
    );
    if has_external {
        writeln!(
            out,
            "build {ext_args}: ext_includes_args\n  command = {SHIM} -- package-index includes > $out"
        )
        .unwrap();
    }

    // 4. compile rules
    let obj_path = format!("{}/{name}.o", dir.display());
    let mut obj_deps = vec![pp_src.clone(), includes_args.clone()];
    if has_external {
        obj_deps.push(ext_args.clone());
    }
    for req in &m.requires {
        if let Some(target) = req.value.path_target() {
            let target_dir = build_dir_for(home, target);
            match &req.value {
                Directive::Module(_) => {
                    obj_deps.push(format!("{}/{}.cmi", target_dir.display(), normalize(target)))
                }
                Directive::Library(_) => {
                    obj_deps.push(format!("{}/{}.a", target_dir.display(), normalize(target)))
                }
                Directive::ExternalLib { .. } => unreachable!("filtered by path_target"),
            }
        }
    }

    if let Some(pp_intf_path) = &pp_intf {
        let cmi_path = format!("{}/{name}.cmi", dir.display());
        writeln!(
            out,
            "build {cmi_path}: compile_intf {pp_intf_path}\n  command = {SHIM} -- compilefast -o $out $in"
        )
        .unwrap();
        writeln!(
            out,
            "build {obj_path}: compile {} | {}\n  command = {SHIM} -- compile -cmi-file {cmi_path} -o $out $in",
            obj_deps.join(" "),
            cmi_path
        )
        .unwrap();
    } else {
        writeln!(
            out,
            "build {obj_path}: compile {}\n  command = {SHIM} -- compile -o $out $in",
            obj_deps.join(" ")
        )
        .unwrap();
    }

    // 5. bin-annot phony
    writeln!(out, "build {dir}/bin-annot: phony {obj_path}", dir = dir.display()).unwrap();

    out
}

fn emit_library_fragment(l: &LibraryUnit, home: &Path) -> String {
    let dir = build_dir_for(home, &l.path_dir);
    let mut out = String::new();
    writeln!(out, "# library {}", l.path_dir.display()).unwrap();

    let has_external = l
        .requires
        .iter()
        .any(|r| matches!(r.value, Directive::ExternalLib { .. }));
    let dep_dirs = dep_build_dirs(l.requires.iter().map(|r| &r.value), home);

    // 1. preprocess rules for every member
    for member in &l.members {
        let name = normalize(&member.file_src);
        let pp_src = format!("{}/{name}.ml", dir.display());
        writeln!(
            out,
            "build {pp_src}: preprocess {}\n  command = {SHIM} -- pp -o $out $in",
            member.file_src.display()
        )
        .unwrap();
        if let Some(intf) = &member.file_intf {
            let pp_intf = format!("{}/{name}.mli", dir.display());
            writeln!(
                out,
                "build {pp_intf}: preprocess {}\n  command = {SHIM} -- pp -o $out $in",
                intf.display()
            )
            .unwrap();
        }
    }

    // 2. includes.args: own dir first, then path-like requires, then external
    let includes_args = format!("{}/includes.args", dir.display());
    let ext_args = format!("{}/ext_includes.args", dir.display());
    write_includes_args_rule(
        &mut out,
        &includes_args,
        None,
        Some(&dir),
        &dep_dirs,
        has_external.then_some(ext_args.as_str()),
    );
    if has_external {
        writeln!(
            out,
            "build {ext_args}: ext_includes_args\n  command = {SHIM} -- package-index includes > $out"
        )
        .unwrap();
    }

    // 3/4. per-member dependency-extraction + compile with dyndep
    let mut dep_outputs = Vec::new();
    for member in &l.members {
        let name = normalize(&member.file_src);
        let pp_src = format!("{}/{name}.ml", dir.display());
        let dep_out = format!("{}/{name}.dep", dir.display());
        writeln!(
            out,
            "build {dep_out}: extract_deps {pp_src}\n  command = {SHIM} -- deps -o $out $in"
        )
        .unwrap();
        dep_outputs.push(dep_out.clone());

        let obj_path = format!("{}/{name}.o", dir.display());
        writeln!(
            out,
            "build {obj_path}: compile {pp_src} {includes_args} || {dep_out}\n  dyndep = {dep_out}\n  command = {SHIM} -- compile -o $out $in"
        )
        .unwrap();
    }

    // 5. link-order rule
    let link_deps = format!("{}/{}.link-deps", dir.display(), normalize(&l.path_dir));
    writeln!(
        out,
        "build {link_deps}: link_order {}\n  command = link-deps {} > $out",
        dep_outputs.join(" "),
        dep_outputs.join(" ")
    )
    .unwrap();

    // 6. archive rule
    let archive = format!("{}/{}.a", dir.display(), normalize(&l.path_dir));
    writeln!(
        out,
        "build {archive}: archive | {link_deps}\n  command = {SHIM} -- archive -o $out @{link_deps}"
    )
    .unwrap();
    writeln!(out, "build {archive}.stamp: phony {archive}").unwrap();

    out
}

fn emit_root_fragment(state: &GraphState, home: &Path, runtime_self_path: &Path) -> String {
    let mut out = String::new();
    writeln!(out, "mach_self = {}", runtime_self_path.display()).unwrap();
    out.push('\n');

    // Include every unit's own fragment, in DFS post-order.
    for unit in &state.units {
        let dir = build_dir_for(home, unit.path());
        writeln!(out, "include {}/{UNIT_FRAGMENT_NAME}", dir.display()).unwrap();
    }
    out.push('\n');

    writeln!(out, "build all: phony $entry_out").unwrap();
    out.push('\n');

    let Some(entry) = state.entry_point() else {
        return out;
    };
    let entry_dir = build_dir_for(home, entry.path());

    // Object list in DFS post-order, external libs linked before module objects.
    let mut external_names = Vec::new();
    let mut object_paths = Vec::new();
    for unit in &state.units {
        match unit {
            Unit::Module(m) => {
                let name = normalize(&m.path_src);
                object_paths.push(format!("{}/{name}.o", build_dir_for(home, &m.path_src).display()));
            }
            Unit::Library(l) => {
                let name = normalize(&l.path_dir);
                object_paths.push(format!("{}/{name}.a", build_dir_for(home, &l.path_dir).display()));
            }
        }
        for req in unit.requires() {
            if let Directive::ExternalLib { name, .. } = &req.value {
                if !external_names.contains(name) {
                    external_names.push(name.clone());
                }
            }
        }
    }

    let all_objects_args = format!("{}/all_objects.args", entry_dir.display());
    writeln!(
        out,
        "build {all_objects_args}: all_objects_args\n  command = printf '%s\\n' {} > $out",
        object_paths.join(" ")
    )
    .unwrap();

    let has_external = !external_names.is_empty();
    if has_external {
        let ext_link_args = format!("{}/ext_link.args", entry_dir.display());
        writeln!(
            out,
            "build {ext_link_args}: ext_link_args\n  command = {SHIM} -- package-index links {} > $out",
            external_names.join(" ")
        )
        .unwrap();
    }

    let entry_out = format!("{}/a.out", entry_dir.display());
    let ext_link_args = format!("{}/ext_link.args", entry_dir.display());
    let mut deps = vec![all_objects_args.clone()];
    if has_external {
        deps.push(ext_link_args.clone());
    }
    // External libraries are linked before module objects (§4.5 "Ordering and tie-breaks").
    writeln!(
        out,
        "build {entry_out}: link {}\n  command = {SHIM} -- compile -o $out{} @{all_objects_args}",
        deps.join(" "),
        if has_external {
            format!(" @{ext_link_args}")
        } else {
            String::new()
        }
    )
    .unwrap();

    out.replace("$entry_out", &entry_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dialect, EnvFingerprint, FileStat, LibraryMember, WithLoc};
    use std::path::PathBuf;

    fn env() -> EnvFingerprint {
        EnvFingerprint {
            runtime_self_path: PathBuf::from("/usr/bin/mach"),
            compiler_version: "1.0.0".into(),
            package_index_version: None,
        }
    }

    fn module(path: &str, requires: Vec<WithLoc<Directive>>) -> Unit {
        Unit::Module(ModuleUnit {
            path_src: PathBuf::from(path),
            stat_src: FileStat { mtime: 1, size: 1 },
            path_intf: None,
            stat_intf: None,
            dialect: Dialect::Primary,
            requires,
        })
    }

    #[test]
    fn single_module_root_fragment_links_in_dfs_order() {
        let state = GraphState {
            env_fingerprint: env(),
            units: vec![module("/proj/main.ml", Vec::new())],
        };
        let home = Path::new("/home/.mach");
        let fragments = emit(
            &state,
            home,
            Path::new("/proj/main.ml"),
            Path::new("/usr/bin/mach"),
            None,
            |_| false,
        );
        let root = fragments.last().unwrap();
        assert!(root.contents.contains("build all: phony"));
        assert!(root.contents.contains("a.out"));
    }

    #[test]
    fn external_libs_precede_module_objects_in_link_args() {
        let state = GraphState {
            env_fingerprint: env(),
            units: vec![module(
                "/proj/main.ml",
                vec![WithLoc::new(
                    Directive::ExternalLib {
                        name: "stdlib".into(),
                        version: "1.0.0".into(),
                    },
                    "/proj/main.ml",
                    1,
                )],
            )],
        };
        let home = Path::new("/home/.mach");
        let fragments = emit(
            &state,
            home,
            Path::new("/proj/main.ml"),
            Path::new("/usr/bin/mach"),
            None,
            |_| false,
        );
        let root = fragments.last().unwrap();
        assert!(root.contents.contains("ext_link.args"));

        let command_line = root
            .contents
            .lines()
            .find(|l| l.trim_start().starts_with("command =") && l.contains("compile -o $out"))
            .expect("link recipe present");
        let ext_pos = command_line
            .find("ext_link.args")
            .expect("ext_link.args passed as a recipe arg");
        let all_obj_pos = command_line
            .find("all_objects.args")
            .expect("all_objects.args passed as a recipe arg");
        assert!(
            ext_pos < all_obj_pos,
            "ext_link.args should precede all_objects.args on the link recipe's command line, \
             since external libraries link before module objects"
        );
    }

    #[test]
    fn partial_emit_skips_unchanged_units_with_existing_build_dir() {
        let state = GraphState {
            env_fingerprint: env(),
            units: vec![
                module("/proj/lib.ml", Vec::new()),
                module(
                    "/proj/main.ml",
                    vec![WithLoc::new(
                        Directive::Module(PathBuf::from("/proj/lib.ml")),
                        "/proj/main.ml",
                        1,
                    )],
                ),
            ],
        };
        let home = Path::new("/home/.mach");
        let mut changed = std::collections::HashSet::new();
        changed.insert(PathBuf::from("/proj/main.ml"));

        let fragments = emit(
            &state,
            home,
            Path::new("/proj/main.ml"),
            Path::new("/usr/bin/mach"),
            Some(&changed),
            |_| true, // every build dir already exists
        );
        // Only main.ml's fragment plus the always-re-emitted root fragment.
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn library_fragment_orders_member_rules_and_archives() {
        let lib = LibraryUnit {
            path_dir: PathBuf::from("/proj/libdir"),
            stat_dir: FileStat { mtime: 1, size: 0 },
            stat_manifest: FileStat { mtime: 1, size: 0 },
            members: vec![
                LibraryMember {
                    file_src: PathBuf::from("/proj/libdir/a.ml"),
                    file_intf: None,
                },
                LibraryMember {
                    file_src: PathBuf::from("/proj/libdir/b.ml"),
                    file_intf: Some(PathBuf::from("/proj/libdir/b.mli")),
                },
            ],
            requires: Vec::new(),
        };
        let fragment = emit_library_fragment(&lib, Path::new("/home/.mach"));
        assert!(fragment.contains(".link-deps"));
        assert!(fragment.contains(".a: archive"));
        assert!(fragment.contains("dyndep ="));
    }
}
