use flate2::write::GzEncoder;
use flate2::Compression;
use ocilaunch_runtime::spec::minimal_spec;
use ocilaunch_runtime::{BundleProvider, CancelToken, ImageCache, LayoutBundleProvider, RuntimeError};
use ocilaunch_schema::SysContext;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

fn put_blob(layout: &Path, data: &[u8]) -> (String, u64) {
    let hex = hex::encode(Sha256::digest(data));
    let dir = layout.join("blobs/sha256");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(&hex), data).unwrap();
    (format!("sha256:{hex}"), data.len() as u64)
}

fn gzip_layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    gz.finish().unwrap()
}

/// Write a single-platform layout with two layers and return its directory.
fn make_layout(root: &Path, arch: &str) -> std::path::PathBuf {
    let layout = root.join("layout");
    fs::create_dir_all(&layout).unwrap();
    fs::write(layout.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    let (l1, s1) = put_blob(
        &layout,
        &gzip_layer(&[("etc/passwd", "root:x:0:0:root:/root:/bin/sh\n"), ("tmp/gone", "x")]),
    );
    let (l2, s2) = put_blob(&layout, &gzip_layer(&[("tmp/.wh.gone", ""), ("bin/app", "#!")]));

    let config = serde_json::json!({
        "architecture": arch,
        "os": "linux",
        "config": {"User": "0", "Entrypoint": ["/bin/app"], "WorkingDir": "/srv"}
    });
    let (cfg, cfg_size) = put_blob(&layout, config.to_string().as_bytes());

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": cfg, "size": cfg_size},
        "layers": [
            {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": l1, "size": s1},
            {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": l2, "size": s2}
        ]
    });
    let (m, m_size) = put_blob(&layout, manifest.to_string().as_bytes());

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": m,
            "size": m_size,
            "platform": {"architecture": arch, "os": "linux"},
            "annotations": {"org.opencontainers.image.ref.name": "latest"}
        }]
    });
    fs::write(layout.join("index.json"), index.to_string()).unwrap();
    layout
}

fn context(arch: &str) -> SysContext {
    SysContext {
        os_choice: Some("linux".to_owned()),
        arch_choice: Some(arch.to_owned()),
        auth_file: None,
    }
}

#[test]
fn layout_bundle_extracts_layers_and_reads_config() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "amd64");
    let bundle_dir = tmp.path().join("bundle");
    fs::create_dir_all(&bundle_dir).unwrap();

    let image_ref = format!("oci:{}:latest", layout.display());
    let mut bundle = LayoutBundleProvider
        .new_bundle(&bundle_dir, &image_ref, &context("amd64"), None)
        .unwrap();
    bundle.create(&minimal_spec(), &CancelToken::new()).unwrap();

    let image = bundle.image_spec().unwrap();
    assert_eq!(image.config.entrypoint, vec!["/bin/app"]);
    assert_eq!(image.config.working_dir, "/srv");

    let rootfs = bundle.rootfs();
    assert!(rootfs.join("etc/passwd").is_file());
    assert!(rootfs.join("bin/app").is_file());
    assert!(!rootfs.join("tmp/gone").exists());
    assert!(bundle_dir.join("config.json").is_file());
}

#[test]
fn update_rewrites_config() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "amd64");
    let bundle_dir = tmp.path().join("bundle");
    fs::create_dir_all(&bundle_dir).unwrap();

    let mut bundle = LayoutBundleProvider
        .new_bundle(
            &bundle_dir,
            &format!("oci:{}", layout.display()),
            &context("amd64"),
            None,
        )
        .unwrap();
    bundle.create(&minimal_spec(), &CancelToken::new()).unwrap();

    let mut spec = minimal_spec();
    spec.hostname = Some("updated".to_owned());
    bundle.update(&spec, &CancelToken::new()).unwrap();
    let written = fs::read_to_string(bundle_dir.join("config.json")).unwrap();
    assert!(written.contains("\"updated\""));
}

#[test]
fn platform_mismatch_is_unsupported() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "arm64");
    let bundle_dir = tmp.path().join("bundle");
    fs::create_dir_all(&bundle_dir).unwrap();

    let mut bundle = LayoutBundleProvider
        .new_bundle(
            &bundle_dir,
            &format!("oci:{}", layout.display()),
            &context("amd64"),
            None,
        )
        .unwrap();
    let err = bundle.create(&minimal_spec(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::UnsupportedImage(_)));
}

#[test]
fn tampered_blob_fails_verification() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "amd64");

    // Corrupt every layer blob (the gzip ones start with the gzip magic).
    for entry in fs::read_dir(layout.join("blobs/sha256")).unwrap() {
        let path = entry.unwrap().path();
        let data = fs::read(&path).unwrap();
        if data.starts_with(&[0x1f, 0x8b]) {
            fs::write(&path, gzip_layer(&[("evil", "x")])).unwrap();
        }
    }

    let bundle_dir = tmp.path().join("bundle");
    fs::create_dir_all(&bundle_dir).unwrap();
    let mut bundle = LayoutBundleProvider
        .new_bundle(
            &bundle_dir,
            &format!("oci:{}", layout.display()),
            &context("amd64"),
            None,
        )
        .unwrap();
    let err = bundle.create(&minimal_spec(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::DigestMismatch { .. }));
}

#[test]
fn cache_records_verified_blobs() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "amd64");
    let cache = ImageCache::open(&tmp.path().join("cache")).unwrap();

    for n in 0..2 {
        let bundle_dir = tmp.path().join(format!("bundle{n}"));
        fs::create_dir_all(&bundle_dir).unwrap();
        let mut bundle = LayoutBundleProvider
            .new_bundle(
                &bundle_dir,
                &format!("oci:{}", layout.display()),
                &context("amd64"),
                Some(cache.clone()),
            )
            .unwrap();
        bundle.create(&minimal_spec(), &CancelToken::new()).unwrap();
    }

    // manifest + config + two layers
    let records = fs::read_dir(cache.root().join("verified")).unwrap().count();
    assert_eq!(records, 4);
}

#[test]
fn cancelled_create_stops_before_layers() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = make_layout(tmp.path(), "amd64");
    let bundle_dir = tmp.path().join("bundle");
    fs::create_dir_all(&bundle_dir).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut bundle = LayoutBundleProvider
        .new_bundle(
            &bundle_dir,
            &format!("oci:{}", layout.display()),
            &context("amd64"),
            None,
        )
        .unwrap();
    let err = bundle.create(&minimal_spec(), &cancel).unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled));
    assert!(!bundle_dir.join("config.json").exists());
}
