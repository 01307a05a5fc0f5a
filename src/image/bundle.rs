//! App-bundle module built from the proto-converted container.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::action::{BuildAction, Step};
use crate::config::BuildInput;
use crate::paths::OutPaths;
use crate::preflight::HostTools;
use crate::selector::{FileClass, Selection};

#[derive(Debug, Serialize)]
struct Compression {
    uncompressed_glob: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ApkConfig {
    package_name: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct ApexConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    apex_embedded_apk_config: Vec<ApkConfig>,
}

#[derive(Debug, Serialize)]
struct BundleConfig {
    compression: Compression,
    apex_config: ApexConfig,
}

/// `bundle_config.json` for the bundle tool.
pub fn bundle_config(selection: &Selection) -> Result<String> {
    let embedded = selection
        .files
        .iter()
        .filter(|f| matches!(f.class, FileClass::App | FileClass::AppSet))
        .filter_map(|f| {
            f.overridden_package_name.as_ref().map(|pkg| ApkConfig {
                package_name: pkg.clone(),
                path: f.path(),
            })
        })
        .collect();

    let config = BundleConfig {
        compression: Compression {
            uncompressed_glob: vec!["apex_payload.img", "apex_manifest.*"],
        },
        apex_config: ApexConfig {
            apex_embedded_apk_config: embedded,
        },
    };
    Ok(serde_json::to_string(&config)?)
}

/// ABI tag of the payload: unique target ABIs joined by `.`.
pub fn abi_tag(input: &BuildInput) -> String {
    let mut abis: Vec<&str> = Vec::new();
    for arch in &input.product.targets {
        if !abis.contains(&arch.abi()) {
            abis.push(arch.abi());
        }
    }
    abis.join(".")
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn plan(
    input: &BuildInput,
    selection: &Selection,
    paths: &OutPaths,
    tools: &HostTools,
) -> Result<Vec<BuildAction>> {
    let config = paths.bundle_config();
    let proto = paths.proto();
    let out = paths.bundle();
    let base = with_suffix(&out, ".base");
    let config_zip = with_suffix(&out, ".config");
    let abi = abi_tag(input);

    let write_config = BuildAction::new("bundle_config", format!("write {}", config.display()))
        .output(&config)
        .step(Step::WriteFile {
            path: config.clone(),
            content: bundle_config(selection)?,
        });

    let renames = [
        ("apex_payload.img".to_string(), format!("apex/{}.img", abi)),
        (
            "apex_build_info.pb".to_string(),
            format!("apex/{}.build_info.pb", abi),
        ),
        (
            "apex_manifest.json".to_string(),
            "root/apex_manifest.json".to_string(),
        ),
        (
            "apex_manifest.pb".to_string(),
            "root/apex_manifest.pb".to_string(),
        ),
        (
            "AndroidManifest.xml".to_string(),
            "manifest/AndroidManifest.xml".to_string(),
        ),
        (
            "assets/NOTICE.html.gz".to_string(),
            "assets/NOTICE.html.gz".to_string(),
        ),
    ];
    let zip2zip = tools
        .cmd("zip2zip")
        .arg("-i")
        .arg_path(&proto)
        .arg("-o")
        .arg_path(&base)
        .args(renames.iter().map(|(from, to)| format!("{}:{}", from, to)));

    let config_dir = paths.root().to_path_buf();
    let soong_zip = tools
        .cmd("soong_zip")
        .arg("-o")
        .arg_path(&config_zip)
        .arg("-C")
        .arg_path(&config_dir)
        .arg("-f")
        .arg_path(&config);

    let merge = tools
        .cmd("merge_zips")
        .arg_path(&out)
        .arg_path(&base)
        .arg_path(&config_zip);

    let bundle = BuildAction::new("apex_bundle", "apex bundle module")
        .input(&proto)
        .input(&config)
        .output(&out)
        .output(&base)
        .output(&config_zip)
        .step(Step::Tool(zip2zip))
        .step(Step::Tool(soong_zip))
        .step(Step::Tool(merge));

    Ok(vec![write_config, bundle])
}
