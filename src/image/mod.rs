//! Image assembly: staging, packaging, proto conversion.
//!
//! The staging steps and the packaging tool run inside one action, so the
//! image directory is always rebuilt from scratch before the tool sees it.

pub mod bundle;
pub mod reports;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::action::{BuildAction, Step};
use crate::config::{BuildInput, ImageVariant, ProductConfig};
use crate::graph::stubs::FUTURE_API_LEVEL;
use crate::paths::OutPaths;
use crate::preflight::HostTools;
use crate::process::{Arg, Cmd};
use crate::selector::{FileClass, Selection};

const APEXER_TOOL_PATH_ENV: &str = "APEXER_TOOL_PATH";

fn api_fingerprint(product: &ProductConfig) -> Option<&Path> {
    if product.platform_sdk_final {
        return None;
    }
    product.api_fingerprint_file.as_deref()
}

fn fingerprinted(product: &ProductConfig, fingerprint: &Path) -> Arg {
    Arg::FileContents {
        prefix: format!("{}.", product.platform_sdk_codename),
        path: fingerprint.to_path_buf(),
    }
}

/// Target SDK of the container; it has no target SDK of its own.
pub fn target_sdk_version(product: &ProductConfig) -> Arg {
    if let Some(fp) = api_fingerprint(product) {
        return fingerprinted(product, fp);
    }
    let level = if product.platform_sdk_final {
        product.platform_sdk_version
    } else {
        FUTURE_API_LEVEL
    };
    Arg::Literal(level.to_string())
}

/// Minimum SDK as the packaging tool understands it; `current` becomes a codename.
pub fn min_sdk_version(input: &BuildInput) -> Arg {
    let product = &input.product;
    match input.apex.min_sdk_version.as_deref() {
        Some(v) if v != "current" => Arg::Literal(v.to_string()),
        _ => match api_fingerprint(product) {
            Some(fp) => fingerprinted(product, fp),
            None if product.platform_sdk_final => {
                Arg::Literal(product.platform_sdk_version.to_string())
            }
            None => Arg::Literal(product.platform_sdk_codename.clone()),
        },
    }
}

/// Whether the payload keeps its dm-verity hash tree.
pub fn needs_hashtree(input: &BuildInput) -> Result<bool> {
    if crate::sign::should_compress(&input.product, &input.apex) {
        return Ok(true);
    }
    if matches!(input.apex.min_sdk_level()?, Some(level) if level <= 29) {
        return Ok(true);
    }
    Ok(input.apex.generate_hashtree.unwrap_or(true))
}

/// Package name the embedded APK manifest is rewritten to, if any.
pub fn override_package_name(input: &BuildInput) -> Option<String> {
    input
        .product
        .package_name_overrides
        .get(&input.apex.name)
        .or(input.apex.override_apk_package_name.as_ref())
        .cloned()
}

/// Steps that rebuild the image directory, and the files they read.
pub fn staging_steps(selection: &Selection, image_dir: &Path) -> (Vec<Step>, Vec<PathBuf>) {
    let mut steps = vec![
        Step::RemoveAll(image_dir.to_path_buf()),
        Step::MkDirs(vec![image_dir.to_path_buf()]),
    ];
    let mut inputs = Vec::new();

    for file in &selection.files {
        let dest = image_dir.join(file.path());
        let dest_dir = image_dir.join(&file.install_dir);
        if file.class == FileClass::AppSet {
            steps.push(Step::RemoveAll(dest_dir.clone()));
        }
        steps.push(Step::MkDirs(vec![dest_dir.clone()]));

        if file.link_to_platform {
            steps.push(Step::Symlink {
                target: file.platform_path(),
                link: dest,
            });
        } else {
            inputs.push(file.built_file.clone());
            steps.push(Step::Copy {
                src: file.built_file.clone(),
                dst: dest,
            });
            if let Some(archive) = &file.app_set_archive {
                inputs.push(archive.clone());
                steps.push(Step::Unzip {
                    archive: archive.clone(),
                    dest: dest_dir.clone(),
                });
            }
            for link in file.symlink_paths() {
                steps.push(Step::Symlink {
                    target: file.stem.clone(),
                    link: image_dir.join(link),
                });
            }
        }

        for data in &file.data_files {
            inputs.push(data.src.clone());
            steps.push(Step::Copy {
                src: data.src.clone(),
                dst: dest_dir.join(&data.rel),
            });
        }
    }
    (steps, inputs)
}

/// Flags shared by every image variant, after the variant's base flags.
fn optional_flags(input: &BuildInput, paths: &OutPaths, has_notice: bool) -> Result<Vec<Arg>> {
    let apex = &input.apex;
    let lit = |s: &str| Arg::Literal(s.to_string());
    let path = |p: &Path| Arg::Path(p.to_path_buf());

    let key = input.key()?;
    let mut flags = vec![lit("--pubkey"), path(&key.public_key)];

    if let Some(pkg) = override_package_name(input) {
        flags.extend([lit("--override_apk_package_name"), Arg::Literal(pkg)]);
    }
    match &apex.android_manifest {
        Some(manifest) => flags.extend([lit("--android_manifest"), path(manifest)]),
        None if apex.test => flags.push(lit("--test_only")),
        None => {}
    }

    flags.extend([
        lit("--target_sdk_version"),
        target_sdk_version(&input.product),
        lit("--min_sdk_version"),
        min_sdk_version(input),
    ]);

    if let Some(parent) = apex.logging_parent.as_deref().filter(|p| !p.is_empty()) {
        flags.extend([lit("--logging_parent"), lit(parent)]);
    }
    if has_notice {
        flags.extend([lit("--assets_dir"), path(&paths.notice_dir())]);
    }
    if !needs_hashtree(input)? {
        flags.push(lit("--no_hashtree"));
    }
    if apex.test_only_unsigned_payload {
        flags.push(lit("--unsigned_payload"));
    }
    if apex.needs_legacy_manifest()? {
        flags.extend([lit("--manifest_json"), path(&paths.manifest_legacy())]);
    }
    flags.extend([lit("--payload_fs_type"), lit(apex.payload_fs_type.as_str())]);
    Ok(flags)
}

/// The packaging tool invocation producing the unsigned container.
pub fn apexer_cmd(
    input: &BuildInput,
    paths: &OutPaths,
    tools: &HostTools,
    has_notice: bool,
) -> Result<Cmd> {
    let apex = &input.apex;
    let key = input.key()?;
    let image_dir = paths.image_dir();
    let unsigned = paths.unsigned();

    let core = |cmd: Cmd| {
        cmd.arg("--include_build_info")
            .arg("--force")
            .args(["--payload_type", "image"])
            .arg("--key")
            .arg_path(&key.private_key)
            .arg("--file_contexts")
            .arg_path(paths.file_contexts())
    };

    let cmd = match apex.image_variant {
        ImageVariant::Plain => tools
            .cmd("apexer")
            .arg("--force")
            .arg("--manifest")
            .arg_path(paths.manifest_pb())
            .arg("--file_contexts")
            .arg_path(paths.file_contexts())
            .arg("--canned_fs_config")
            .arg_path(paths.canned_fs_config())
            .arg("--include_build_info")
            .args(["--payload_type", "image"])
            .arg("--key")
            .arg_path(&key.private_key),
        ImageVariant::DedupCommonLibs => {
            let wrapper = tools
                .cmd("apexer_with_DCLA_preprocessing")
                .arg("--apexer")
                .arg(tools.path("apexer"))
                .arg("--canned_fs_config")
                .arg_path(paths.canned_fs_config())
                .arg_path(&image_dir)
                .arg_path(&unsigned)
                .arg("--");
            core(wrapper).arg("--manifest").arg_path(paths.manifest_pb())
        }
        ImageVariant::Trimmed => {
            let wrapper = tools
                .cmd("apexer_with_trim_preprocessing")
                .arg("--apexer")
                .arg(tools.path("apexer"))
                .arg("--canned_fs_config")
                .arg_path(paths.canned_fs_config())
                .arg("--manifest")
                .arg_path(paths.manifest_pb())
                .arg("--libs_to_trim")
                .arg(apex.libs_to_trim.join(","))
                .arg_path(&image_dir)
                .arg_path(&unsigned)
                .arg("--");
            core(wrapper)
        }
    };

    let mut cmd = optional_flags(input, paths, has_notice)?
        .into_iter()
        .fold(cmd, Cmd::arg_value);
    if apex.image_variant == ImageVariant::Plain {
        cmd = cmd.arg_path(&image_dir).arg_path(&unsigned);
    }
    if let Some(search) = tools.search_path() {
        cmd = cmd.env(APEXER_TOOL_PATH_ENV, search);
    }
    Ok(cmd.error_msg(format!("packaging {}", apex.name)))
}

/// Plan staging plus packaging into the unsigned container.
pub fn plan(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    tools: &HostTools,
    has_notice: bool,
) -> Result<BuildAction> {
    let apex = &input.apex;
    let key = input.key()?;
    let image_dir = paths.image_dir();
    let unsigned = paths.unsigned();

    let (staging, staged_inputs) = staging_steps(selection, &image_dir);
    let mut image = BuildAction::new("apex", format!("APEX {} => {}", image_dir.display(), unsigned.display()))
        .steps(staging)
        .inputs(staged_inputs)
        .input(paths.manifest_pb())
        .input(paths.file_contexts())
        .input(paths.canned_fs_config())
        .input(&key.private_key)
        .input(&key.public_key)
        .output(&unsigned)
        .output(&image_dir);
    if let Some(manifest) = &apex.android_manifest {
        image = image.input(manifest);
    }
    if has_notice {
        image = image.input(paths.notice_gz());
    }
    if apex.needs_legacy_manifest()? {
        image = image.input(paths.manifest_legacy());
    }
    if apex.allowed_files.is_some() {
        image = image.validation(paths.allowed_files_stamp());
    }
    Ok(image.step(Step::Tool(apexer_cmd(input, paths, tools, has_notice)?)))
}

/// Convert the unsigned container to the proto resource format.
pub fn proto_convert(paths: &OutPaths, tools: &HostTools) -> BuildAction {
    let unsigned = paths.unsigned();
    let proto = paths.proto();
    BuildAction::new("apex_proto_convert", "apex proto convert")
        .input(&unsigned)
        .output(&proto)
        .step(Step::Tool(
            tools
                .cmd("aapt2")
                .args(["convert", "--output-format", "proto"])
                .arg_path(&unsigned)
                .arg("-o")
                .arg_path(&proto),
        ))
}
