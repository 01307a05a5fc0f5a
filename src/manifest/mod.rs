//! Container manifest.
//!
//! The declared base manifest JSON is augmented once into a full JSON form.
//! Both the protobuf `apex_manifest.pb` and, for API 29 containers, the
//! stripped legacy `apex_manifest.json` are derived from that one document.

pub mod proto;

use anyhow::{Context, Result};
use prost::Message;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::{BuildAction, Step};
use crate::config::{ApexDecl, BuildInput, ProductConfig};
use crate::error::ApexError;
use crate::paths::OutPaths;
use crate::selector::Selection;
pub use proto::ApexManifest;

/// Version given to containers whose base manifest leaves it at 0.
pub const DEFAULT_VERSION: &str = "339990000";

/// Keys understood by runtimes that predate the protobuf manifest.
const LEGACY_KEYS: &[&str] = &[
    "name",
    "version",
    "versionName",
    "preInstallHook",
    "postInstallHook",
];

/// Values computed by the build and merged into the base manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFields {
    /// Applied only when the base manifest's version is 0 or absent.
    pub default_version: i64,
    pub provide_native_libs: Vec<String>,
    pub require_native_libs: Vec<String>,
    pub jni_libs: Vec<String>,
}

/// Resolve the default manifest version.
///
/// An explicit override wins, then the variant digit, then [`DEFAULT_VERSION`].
pub fn resolve_version(product: &ProductConfig, apex: &ApexDecl) -> Result<i64> {
    let mut version = DEFAULT_VERSION.to_string();

    if let Some(variant) = &apex.variant_version {
        if !version.ends_with('0') {
            return Err(ApexError::config(
                &apex.name,
                "variant_version",
                format!("default version {} must end in a zero", version),
            )
            .into());
        }
        let mut chars = variant.chars();
        match (chars.next(), chars.next()) {
            (Some(digit @ '0'..='9'), None) => {
                version.pop();
                version.push(digit);
            }
            _ => {
                return Err(ApexError::config(
                    &apex.name,
                    "variant_version",
                    format!("expected an integer between 0-9; got {}", variant),
                )
                .into())
            }
        }
    }

    if let Some(over) = &product.manifest_version_override {
        version = over.clone();
    }

    version.trim().parse::<i64>().map_err(|_| {
        ApexError::config(
            "product",
            "manifest_version_override",
            format!("manifest version must be an integer; got '{}'", version),
        )
        .into()
    })
}

pub fn manifest_fields(input: &BuildInput, selection: &Selection) -> Result<ManifestFields> {
    Ok(ManifestFields {
        default_version: resolve_version(&input.product, &input.apex)?,
        provide_native_libs: selection.provide_native_libs.clone(),
        require_native_libs: selection.require_native_libs.clone(),
        jni_libs: selection.jni_libs(),
    })
}

fn parse_object(json: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(json).context("parsing manifest JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("manifest JSON must be an object"),
    }
}

fn render(map: Map<String, Value>) -> Result<String> {
    let mut text = serde_json::to_string_pretty(&Value::Object(map))?;
    text.push('\n');
    Ok(text)
}

fn string_list(map: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    let Some(value) = map.get(key) else {
        return Ok(Vec::new());
    };
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .with_context(|| format!("manifest field '{}' must be a list of strings", key))
}

/// Append `values` to the declared list, keeping it sorted and unique.
fn append_list(map: &mut Map<String, Value>, key: &str, values: &[String]) -> Result<Vec<String>> {
    let mut list = string_list(map, key)?;
    list.extend(values.iter().cloned());
    list.sort();
    list.dedup();
    map.insert(
        key.to_string(),
        Value::Array(list.iter().cloned().map(Value::String).collect()),
    );
    Ok(list)
}

/// Produce the full manifest from the declared base manifest.
pub fn augment(json: &str, fields: &ManifestFields) -> Result<String> {
    let mut map = parse_object(json)?;

    let provided = append_list(&mut map, "provideNativeLibs", &fields.provide_native_libs)?;
    let required: Vec<String> = append_list(&mut map, "requireNativeLibs", &fields.require_native_libs)?
        .into_iter()
        .filter(|lib| !provided.contains(lib))
        .collect();
    map.insert(
        "requireNativeLibs".to_string(),
        Value::Array(required.into_iter().map(Value::String).collect()),
    );
    if !fields.jni_libs.is_empty() {
        append_list(&mut map, "jniLibs", &fields.jni_libs)?;
    }

    let unset = match map.get("version") {
        None => true,
        Some(v) => v.as_i64() == Some(0),
    };
    if unset {
        map.insert("version".to_string(), Value::from(fields.default_version));
    }
    render(map)
}

pub fn patch_name(json: &str, name: &str) -> Result<String> {
    let mut map = parse_object(json)?;
    map.insert("name".to_string(), Value::String(name.to_string()));
    render(map)
}

pub fn encode_proto(json: &str) -> Result<Vec<u8>> {
    let manifest: ApexManifest =
        serde_json::from_str(json).context("decoding manifest fields")?;
    if manifest.name.is_empty() {
        anyhow::bail!("manifest has no name");
    }
    Ok(manifest.encode_to_vec())
}

pub fn strip_legacy(json: &str) -> Result<String> {
    let map = parse_object(json)?;
    let stripped = map
        .into_iter()
        .filter(|(k, _)| LEGACY_KEYS.contains(&k.as_str()))
        .collect();
    render(stripped)
}

/// Plan the manifest actions of one container.
pub fn plan(input: &BuildInput, selection: &Selection, paths: &OutPaths) -> Result<Vec<BuildAction>> {
    let apex = &input.apex;
    let fields = manifest_fields(input, selection)?;
    let full = paths.manifest_full();

    let mut prepare = BuildAction::new("apex_manifest", format!("prepare {}", full.display()))
        .input(&apex.manifest)
        .output(&full)
        .step(Step::AugmentManifest {
            input: apex.manifest.clone(),
            fields,
            output: full.clone(),
        });
    if apex.manifest_name() != apex.name {
        prepare = prepare.step(Step::PatchManifestName {
            input: full.clone(),
            name: apex.manifest_name().to_string(),
            output: full.clone(),
        });
    }

    let mut actions = vec![
        prepare,
        BuildAction::new("apex_manifest_pb", format!("convert {}", full.display()))
            .input(&full)
            .output(paths.manifest_pb())
            .step(Step::ConvertManifest {
                input: full.clone(),
                output: paths.manifest_pb(),
            }),
    ];

    if apex.needs_legacy_manifest()? {
        actions.push(
            BuildAction::new("apex_manifest_strip", format!("strip {}", full.display()))
                .input(&full)
                .output(paths.manifest_legacy())
                .step(Step::StripManifest {
                    input: full.clone(),
                    output: paths.manifest_legacy(),
                }),
        );
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_build_input;
    use std::path::Path;

    fn fields() -> ManifestFields {
        ManifestFields {
            default_version: 339990000,
            provide_native_libs: vec!["libfoo.so".into()],
            require_native_libs: vec!["libc.so".into(), "libm.so".into()],
            jni_libs: vec![],
        }
    }

    fn input(extra: &str) -> BuildInput {
        let text = format!(
            r#"
            [apex]
            name = "myapex"
            key = "k"
            {}

            [keys.k]
            public_key = "k.avbpubkey"
            private_key = "k.pem"
            "#,
            extra
        );
        parse_build_input(&text, Path::new("/src")).unwrap()
    }

    #[test]
    fn test_version_resolution_order() {
        let plain = input("");
        assert_eq!(resolve_version(&plain.product, &plain.apex).unwrap(), 339990000);

        let variant = input(r#"variant_version = "3""#);
        assert_eq!(resolve_version(&variant.product, &variant.apex).unwrap(), 339990003);

        let mut product = variant.product.clone();
        product.manifest_version_override = Some("339990007".into());
        assert_eq!(resolve_version(&product, &variant.apex).unwrap(), 339990007);
    }

    #[test]
    fn test_bad_variant_version() {
        for bad in ["10", "x", ""] {
            let i = input(&format!("variant_version = \"{}\"", bad));
            let err = resolve_version(&i.product, &i.apex).unwrap_err();
            let apex_err = err.downcast_ref::<ApexError>().unwrap();
            assert_eq!(apex_err.property(), Some("variant_version"));
        }
    }

    #[test]
    fn test_augment_sets_version_only_when_unset() {
        let out = augment(r#"{"name": "myapex", "version": 0}"#, &fields()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["version"], 339990000);
        assert_eq!(v["requireNativeLibs"], serde_json::json!(["libc.so", "libm.so"]));
        assert!(v.get("jniLibs").is_none());

        let out = augment(r#"{"name": "myapex", "version": 12}"#, &fields()).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["version"], 12);
    }

    #[test]
    fn test_augment_appends_to_declared_lists() {
        let mut f = fields();
        f.jni_libs = vec!["libjni.so".into()];
        let out = augment(
            r#"{"name": "myapex", "provideNativeLibs": ["libbase.so"]}"#,
            &f,
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            v["provideNativeLibs"],
            serde_json::json!(["libbase.so", "libfoo.so"])
        );
        assert_eq!(v["jniLibs"], serde_json::json!(["libjni.so"]));
    }

    #[test]
    fn test_augment_keeps_lists_sorted_unique_and_disjoint() {
        let out = augment(
            r#"{"name": "myapex", "provideNativeLibs": ["libz.so", "libfoo.so"], "requireNativeLibs": ["libm.so", "libz.so"]}"#,
            &fields(),
        )
        .unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            v["provideNativeLibs"],
            serde_json::json!(["libfoo.so", "libz.so"])
        );
        assert_eq!(v["requireNativeLibs"], serde_json::json!(["libc.so", "libm.so"]));
    }

    #[test]
    fn test_augment_rejects_non_string_lists() {
        let err = augment(r#"{"name": "myapex", "jniLibs": [1]}"#, &ManifestFields {
            jni_libs: vec!["libjni.so".into()],
            ..fields()
        })
        .unwrap_err();
        assert!(err.to_string().contains("'jniLibs' must be a list of strings"));
    }

    #[test]
    fn test_proto_is_deterministic_and_decodes() {
        let full = augment(r#"{"name": "myapex", "versionName": "1.0"}"#, &fields()).unwrap();
        let a = encode_proto(&full).unwrap();
        let b = encode_proto(&full).unwrap();
        assert_eq!(a, b);

        let decoded = ApexManifest::decode(a.as_slice()).unwrap();
        assert_eq!(decoded.name, "myapex");
        assert_eq!(decoded.version, 339990000);
        assert_eq!(decoded.version_name, "1.0");
        assert_eq!(decoded.require_native_libs, vec!["libc.so", "libm.so"]);
    }

    #[test]
    fn test_patch_name_and_strip() {
        let full = augment(r#"{"name": "myapex"}"#, &fields()).unwrap();
        let patched = patch_name(&full, "com.android.myapex").unwrap();
        let stripped = strip_legacy(&patched).unwrap();
        let v: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"name": "com.android.myapex", "version": 339990000})
        );
    }

    #[test]
    fn test_plan_legacy_only_for_api_29() {
        let paths = OutPaths::new(Path::new("/out"), "myapex");
        let sel = Selection::default();

        let actions = plan(&input(""), &sel, &paths).unwrap();
        assert_eq!(actions.len(), 2);

        let actions = plan(&input(r#"min_sdk_version = "29""#), &sel, &paths).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[2].outputs, vec![paths.manifest_legacy()]);
    }

    #[test]
    fn test_plan_patches_presented_name() {
        let paths = OutPaths::new(Path::new("/out"), "myapex");
        let actions = plan(
            &input(r#"apex_name = "com.android.myapex""#),
            &Selection::default(),
            &paths,
        )
        .unwrap();
        assert!(actions[0].steps.iter().any(|s| matches!(
            s,
            Step::PatchManifestName { name, .. } if name == "com.android.myapex"
        )));
    }
}
