//! Container signing and compression.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::action::{BuildAction, Step};
use crate::config::{ApexDecl, BuildInput, ProductConfig};
use crate::error::ApexError;
use crate::paths::{OutPaths, APEX_SUFFIX, COMPRESSED_APEX_SUFFIX};
use crate::preflight::HostTools;
use crate::process::Cmd;

/// Alignment flags handed to signapk for every container.
const SIGNAPK_FLAGS: &[&str] = &["-a", "4096", "--align-file-size"];

/// Certificate and private key signing the outer container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerCert {
    pub pem: PathBuf,
    pub key: PathBuf,
}

fn cert_in_dir(dir: &Path, name: &str) -> ContainerCert {
    ContainerCert {
        pem: dir.join(format!("{}.x509.pem", name)),
        key: dir.join(format!("{}.pk8", name)),
    }
}

fn named_cert(input: &BuildInput, property: &str, name: &str) -> Result<ContainerCert> {
    if name.is_empty() {
        return Err(ApexError::config(
            &input.apex.name,
            property,
            "empty certificate reference ':'",
        )
        .into());
    }
    let pair = input.certificates.get(name).ok_or_else(|| {
        ApexError::config(
            &input.apex.name,
            property,
            format!("references undefined certificate '{}'", name),
        )
    })?;
    Ok(ContainerCert {
        pem: pair.certificate.clone(),
        key: pair.private_key.clone(),
    })
}

/// Resolve the container certificate.
///
/// A product override wins, then a `:name` reference into the certificate
/// table, then a bare name looked up in the default certificate dir, then the
/// product default certificate.
pub fn resolve_certificate(input: &BuildInput) -> Result<ContainerCert> {
    let product = &input.product;
    if let Some(name) = product.certificate_overrides.get(&input.apex.name) {
        return named_cert(input, "certificate_overrides", name.trim_start_matches(':'));
    }

    match input.apex.certificate.as_deref() {
        None | Some("") => Ok(cert_in_dir(
            &product.default_cert_dir,
            &product.default_certificate,
        )),
        Some(reference) => match reference.strip_prefix(':') {
            Some(name) => named_cert(input, "certificate", name),
            None if reference.contains('/') => Err(ApexError::config(
                &input.apex.name,
                "certificate",
                format!(
                    "'{}' must be a certificate name or ':module' reference, not a path",
                    reference
                ),
            )
            .into()),
            None => Ok(cert_in_dir(&product.default_cert_dir, reference)),
        },
    }
}

/// Whether the signed container is additionally compressed.
pub fn should_compress(product: &ProductConfig, apex: &ApexDecl) -> bool {
    if apex.test_only_force_compression {
        return true;
    }
    product.compression_enabled && apex.compressible && !apex.test
}

pub fn signapk(tools: &HostTools, cert: &ContainerCert, input: &Path, output: &Path) -> Cmd {
    tools
        .cmd("signapk")
        .args(SIGNAPK_FLAGS.iter().copied())
        .arg_path(&cert.pem)
        .arg_path(&cert.key)
        .arg_path(input)
        .arg_path(output)
        .error_msg(format!("signing {}", output.display()))
}

/// Final artifact of the signing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArtifact {
    pub path: PathBuf,
    pub suffix: &'static str,
    pub compressed: bool,
}

/// Plan signing, and compression when it applies.
pub fn plan(
    input: &BuildInput,
    paths: &OutPaths,
    tools: &HostTools,
) -> Result<(Vec<BuildAction>, SignedArtifact)> {
    let cert = resolve_certificate(input)?;
    let unsigned = paths.unsigned();
    let signed = paths.signed();

    let mut actions = vec![BuildAction::new("signapk", format!("signapk {}", signed.display()))
        .input(&unsigned)
        .input(&cert.pem)
        .input(&cert.key)
        .output(&signed)
        .step(Step::Tool(signapk(tools, &cert, &unsigned, &signed)))];

    if !should_compress(&input.product, &input.apex) {
        return Ok((
            actions,
            SignedArtifact {
                path: signed,
                suffix: APEX_SUFFIX,
                compressed: false,
            },
        ));
    }

    let compressed_unsigned = paths.compressed_unsigned();
    let compressed = paths.compressed();
    let mut compress = tools
        .cmd("apex_compression_tool")
        .arg("compress");
    if let Some(search) = tools.search_path() {
        compress = compress.arg("--apex_compression_tool").arg(search);
    }
    let compress = compress
        .arg("--input")
        .arg_path(&signed)
        .arg("--output")
        .arg_path(&compressed_unsigned);

    actions.push(
        BuildAction::new(
            "compress_apex",
            format!("generate unsigned compressed {}", compressed_unsigned.display()),
        )
        .input(&signed)
        .output(&compressed_unsigned)
        .step(Step::RemoveAll(compressed_unsigned.clone()))
        .step(Step::Tool(compress)),
    );
    actions.push(
        BuildAction::new(
            "sign_compressed_apex",
            format!("sign compressed {}", compressed.display()),
        )
        .input(&compressed_unsigned)
        .input(&cert.pem)
        .input(&cert.key)
        .output(&compressed)
        .step(Step::Tool(signapk(tools, &cert, &compressed_unsigned, &compressed))),
    );

    Ok((
        actions,
        SignedArtifact {
            path: compressed,
            suffix: COMPRESSED_APEX_SUFFIX,
            compressed: true,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_build_input;

    fn input(product: &str, apex: &str) -> BuildInput {
        let text = format!(
            r#"
            [product]
            default_cert_dir = "security"
            {}

            [apex]
            name = "myapex"
            key = "k"
            {}

            [keys.k]
            public_key = "k.avbpubkey"
            private_key = "k.pem"

            [certificates."myapex.cert"]
            certificate = "certs/myapex.x509.pem"
            private_key = "certs/myapex.pk8"
            "#,
            product, apex
        );
        parse_build_input(&text, Path::new("/src")).unwrap()
    }

    #[test]
    fn test_default_certificate() {
        let cert = resolve_certificate(&input("", "")).unwrap();
        assert_eq!(cert.pem, PathBuf::from("/src/security/testkey.x509.pem"));
        assert_eq!(cert.key, PathBuf::from("/src/security/testkey.pk8"));
    }

    #[test]
    fn test_named_certificate_in_default_dir() {
        let cert = resolve_certificate(&input("", r#"certificate = "platform""#)).unwrap();
        assert_eq!(cert.pem, PathBuf::from("/src/security/platform.x509.pem"));
    }

    #[test]
    fn test_certificate_reference() {
        let cert = resolve_certificate(&input("", r#"certificate = ":myapex.cert""#)).unwrap();
        assert_eq!(cert.pem, PathBuf::from("/src/certs/myapex.x509.pem"));
        assert_eq!(cert.key, PathBuf::from("/src/certs/myapex.pk8"));
    }

    #[test]
    fn test_product_override_wins() {
        let i = input(
            r#"certificate_overrides = { myapex = "myapex.cert" }"#,
            r#"certificate = "platform""#,
        );
        let cert = resolve_certificate(&i).unwrap();
        assert_eq!(cert.pem, PathBuf::from("/src/certs/myapex.x509.pem"));
    }

    #[test]
    fn test_malformed_references() {
        for bad in [":", ":missing", "certs/platform"] {
            let i = input("", &format!("certificate = \"{}\"", bad));
            let err = resolve_certificate(&i).unwrap_err();
            let apex_err = err.downcast_ref::<ApexError>().unwrap();
            assert_eq!(apex_err.property(), Some("certificate"), "{}", bad);
        }
    }

    #[test]
    fn test_compression_policy() {
        let i = input("compression_enabled = true", "compressible = true");
        assert!(should_compress(&i.product, &i.apex));

        let i = input("compression_enabled = true", "compressible = true\ntest = true");
        assert!(!should_compress(&i.product, &i.apex));

        let i = input("", "test = true\ntest_only_force_compression = true");
        assert!(should_compress(&i.product, &i.apex));

        let i = input("", "compressible = true");
        assert!(!should_compress(&i.product, &i.apex));
    }

    #[test]
    fn test_plan_compressed_chain() {
        let i = input("compression_enabled = true", "compressible = true");
        let paths = OutPaths::new(Path::new("/out"), "myapex");
        let (actions, artifact) = plan(&i, &paths, &HostTools::default()).unwrap();

        assert_eq!(actions.len(), 3);
        assert!(artifact.compressed);
        assert_eq!(artifact.path, PathBuf::from("/out/myapex/myapex.capex"));
        assert_eq!(actions[1].inputs, vec![paths.signed()]);
        assert_eq!(actions[2].inputs[0], paths.compressed_unsigned());

        let Step::Tool(cmd) = &actions[0].steps[0] else {
            panic!("expected a tool step");
        };
        assert_eq!(
            cmd.arg_strings(),
            vec![
                "-a",
                "4096",
                "--align-file-size",
                "/src/security/testkey.x509.pem",
                "/src/security/testkey.pk8",
                "/out/myapex/myapex.apex.unsigned",
                "/out/myapex/myapex.apex",
            ]
        );
    }

    #[test]
    fn test_plan_uncompressed() {
        let i = input("", "");
        let paths = OutPaths::new(Path::new("/out"), "myapex");
        let (actions, artifact) = plan(&i, &paths, &HostTools::default()).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(artifact.suffix, ".apex");
    }
}
