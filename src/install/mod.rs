//! Install planning.
//!
//! An activated container installs as one file under
//! `<partition>/apex/`. A flattened container installs its payload as a plain
//! directory tree instead, laid out exactly like the staged image.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::action::{BuildAction, Step};
use crate::config::BuildInput;
use crate::image;
use crate::paths::OutPaths;
use crate::selector::Selection;
use crate::sign::SignedArtifact;

/// How the container lands in the install tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    Activated {
        target: PathBuf,
        /// (link, target) pairs created next to the installed file.
        compat_symlinks: Vec<(PathBuf, String)>,
    },
    Flattened {
        dir: PathBuf,
        marker: PathBuf,
    },
    Skipped,
}

impl InstallPlan {
    pub fn is_skipped(&self) -> bool {
        matches!(self, InstallPlan::Skipped)
    }
}

fn apex_dir(install_root: &Path, partition: &str) -> PathBuf {
    install_root.join(partition).join("apex")
}

/// Decide the install mode and plan its actions.
pub fn plan(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    artifact: &SignedArtifact,
) -> Result<(InstallPlan, Vec<BuildAction>)> {
    let apex = &input.apex;
    if !apex.installable {
        tracing::debug!(apex = %apex.name, "not installable; skipping install");
        return Ok((InstallPlan::Skipped, Vec::new()));
    }

    let root = apex_dir(paths.install_root(), &apex.partition);
    if input.product.flatten_apex {
        return flattened(input, selection, paths, &root);
    }

    let target = root.join(format!("{}{}", apex.name, artifact.suffix));
    let compat_symlinks: Vec<(PathBuf, String)> = apex
        .compat_symlinks
        .iter()
        .map(|s| (paths.install_root().join(&s.link), s.target.clone()))
        .collect();

    let mut action = BuildAction::new("install_apex", format!("install {}", target.display()))
        .input(&artifact.path)
        .output(&target)
        .step(Step::Copy {
            src: artifact.path.clone(),
            dst: target.clone(),
        });
    for (link, link_target) in &compat_symlinks {
        action = action.output(link).step(Step::Symlink {
            target: link_target.clone(),
            link: link.clone(),
        });
    }

    Ok((
        InstallPlan::Activated {
            target,
            compat_symlinks,
        },
        vec![action],
    ))
}

fn flattened(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    root: &Path,
) -> Result<(InstallPlan, Vec<BuildAction>)> {
    let key = input.key()?;
    let dir = root.join(input.apex.manifest_name());
    let marker = paths.flattened_marker();

    let (steps, inputs) = image::staging_steps(selection, &dir);
    let install = BuildAction::new("install_flattened_apex", format!("install {}", dir.display()))
        .steps(steps)
        .inputs(inputs)
        .input(paths.manifest_pb())
        .input(&key.public_key)
        .output(&dir)
        .step(Step::Copy {
            src: paths.manifest_pb(),
            dst: dir.join("apex_manifest.pb"),
        })
        .step(Step::Copy {
            src: key.public_key.clone(),
            dst: dir.join("apex_pubkey"),
        });

    let phony = BuildAction::new("flattened_apex", format!("phony {}", marker.display()))
        .input(&dir)
        .output(&marker)
        .step(Step::WriteFile {
            path: marker.clone(),
            content: String::new(),
        });

    Ok((InstallPlan::Flattened { dir, marker }, vec![install, phony]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::executor::LocalExecutor;
    use crate::action::{ActionGraph, ActionSink};
    use crate::config::parse_build_input;
    use crate::graph::DataFile;
    use crate::paths::APEX_SUFFIX;
    use crate::selector::{ApexFile, FileClass};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn input(base: &Path, product: &str, apex: &str) -> BuildInput {
        let text = format!(
            r#"
            [product]
            {}

            [apex]
            name = "com.android.foo"
            key = "k"
            {}

            [keys.k]
            public_key = "k.avbpubkey"
            private_key = "k.pem"
            "#,
            product, apex
        );
        parse_build_input(&text, base).unwrap()
    }

    fn artifact(paths: &OutPaths) -> SignedArtifact {
        SignedArtifact {
            path: paths.signed(),
            suffix: APEX_SUFFIX,
            compressed: false,
        }
    }

    /// Relative path to file contents or symlink target.
    fn tree(root: &Path) -> BTreeMap<String, String> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                let content = if e.file_type().is_symlink() {
                    format!("-> {}", fs::read_link(e.path()).unwrap().display())
                } else {
                    fs::read_to_string(e.path()).unwrap()
                };
                (rel, content)
            })
            .collect()
    }

    #[test]
    fn test_activated_install_with_compat_symlink() {
        let i = input(
            Path::new("/src"),
            "",
            r#"compat_symlinks = [{ link = "system/apex/com.android.foo.legacy.apex", target = "com.android.foo.apex" }]"#,
        );
        let paths = OutPaths::new(Path::new("/out"), "com.android.foo");
        let (plan, actions) = plan(&i, &Selection::default(), &paths, &artifact(&paths)).unwrap();

        assert_eq!(
            plan,
            InstallPlan::Activated {
                target: PathBuf::from("/out/install/system/apex/com.android.foo.apex"),
                compat_symlinks: vec![(
                    PathBuf::from("/out/install/system/apex/com.android.foo.legacy.apex"),
                    "com.android.foo.apex".to_string()
                )],
            }
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].outputs.len(), 2);
    }

    #[test]
    fn test_non_installable_skipped() {
        let i = input(Path::new("/src"), "", "installable = false");
        let paths = OutPaths::new(Path::new("/out"), "com.android.foo");
        let (plan, actions) = plan(&i, &Selection::default(), &paths, &artifact(&paths)).unwrap();
        assert!(plan.is_skipped());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_flattened_tree_matches_staged_image() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        fs::write(base.join("k.avbpubkey"), "pub").unwrap();
        fs::write(base.join("libfoo.so"), "lib").unwrap();
        fs::write(base.join("foo"), "bin").unwrap();
        fs::write(base.join("foo.conf"), "conf").unwrap();

        let mut lib = ApexFile::new(base.join("libfoo.so"), "lib64", "libfoo.so", FileClass::NativeSharedLib);
        lib.symlinks = vec!["libfoo.so.1".into()];
        let mut bin = ApexFile::new(base.join("foo"), "bin", "foo", FileClass::NativeExecutable);
        bin.data_files = vec![DataFile {
            src: base.join("foo.conf"),
            rel: "foo.conf".into(),
        }];
        let mut libc = ApexFile::new("/unused/libc.so", "lib64", "libc.so", FileClass::NativeSharedLib);
        libc.link_to_platform = true;
        let selection = Selection {
            files: vec![bin, lib, libc],
            ..Default::default()
        };

        let i = input(base, "flatten_apex = true", "");
        let paths = OutPaths::new(&base.join("out"), "com.android.foo");
        fs::create_dir_all(paths.root()).unwrap();
        fs::write(paths.manifest_pb(), "pb").unwrap();

        let (plan, actions) = plan(&i, &selection, &paths, &artifact(&paths)).unwrap();
        let InstallPlan::Flattened { dir, marker } = plan else {
            panic!("expected a flattened install");
        };
        assert_eq!(dir, base.join("out/install/system/apex/com.android.foo"));

        let (staging, _) = image::staging_steps(&selection, &paths.image_dir());
        let mut graph = ActionGraph::new();
        graph
            .register(
                BuildAction::new("stage", "stage")
                    .steps(staging)
                    .output(paths.image_dir()),
            )
            .unwrap();
        for action in actions {
            graph.register(action).unwrap();
        }
        LocalExecutor::new(base.join("out")).execute(&graph).unwrap();

        let mut flattened = tree(&dir);
        assert_eq!(flattened.remove("apex_manifest.pb").as_deref(), Some("pb"));
        assert_eq!(flattened.remove("apex_pubkey").as_deref(), Some("pub"));
        assert_eq!(flattened, tree(&paths.image_dir()));
        assert_eq!(
            fs::read_link(dir.join("lib64/libc.so")).unwrap(),
            PathBuf::from("/system/lib64/libc.so")
        );
        assert!(marker.exists());
    }
}
