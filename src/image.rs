//! OCI-shaped image config and manifest.
//!
//! Neither document carries timestamps, so identical builds serialize to
//! identical bytes and therefore identical digests.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::recipe::Port;
use crate::reference::ImageReference;
use crate::store::Store;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const ANNOTATION_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const ANNOTATION_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";

/// `{}` in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Empty>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl RuntimeConfig {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    pub fn exposes(&self, port: &Port) -> bool {
        self.exposed_ports.contains_key(&port.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub config: RuntimeConfig,
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<History>,
}

impl ImageConfig {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            architecture: oci_architecture().to_string(),
            os: "linux".to_string(),
            config,
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, sha256: &str, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: format!("sha256:{sha256}"),
            size,
            annotations: BTreeMap::new(),
        }
    }

    pub fn hex(&self) -> Result<&str> {
        self.digest
            .strip_prefix("sha256:")
            .with_context(|| format!("unsupported digest '{}'", self.digest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }
}

/// Go-style architecture names used by OCI.
pub fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// A tagged image loaded from the store.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub reference: ImageReference,
    /// `sha256:<hex>` of the manifest.
    pub manifest_digest: String,
    pub manifest_size: u64,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

/// Load a tagged image without running anything.
pub fn inspect(store: &Store, reference: &ImageReference) -> Result<StoredImage> {
    let stored = store
        .resolve_tag(reference)?
        .with_context(|| format!("no image tagged {}", reference.name_and_tag()))?;
    let manifest: ImageManifest = store.read_json_blob(&stored.entry.blob_sha256)?;
    let config: ImageConfig = store.read_json_blob(manifest.config.hex()?)?;
    Ok(StoredImage {
        reference: reference.clone(),
        manifest_digest: format!("sha256:{}", stored.entry.blob_sha256),
        manifest_size: stored.entry.size_bytes,
        manifest,
        config,
    })
}

impl fmt::Display for StoredImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runtime = &self.config.config;
        writeln!(f, "Image:       {}", self.reference.name_and_tag())?;
        writeln!(f, "Digest:      {}", self.manifest_digest)?;
        writeln!(f, "Platform:    {}/{}", self.config.os, self.config.architecture)?;
        writeln!(
            f,
            "WorkingDir:  {}",
            runtime.working_dir.as_deref().unwrap_or("/")
        )?;
        let ports: Vec<&str> = runtime.exposed_ports.keys().map(String::as_str).collect();
        writeln!(
            f,
            "Ports:       {}",
            if ports.is_empty() { "-".to_string() } else { ports.join(", ") }
        )?;
        match &runtime.cmd {
            Some(cmd) => writeln!(f, "Cmd:         {}", cmd.join(" "))?,
            None => writeln!(f, "Cmd:         -")?,
        }
        writeln!(f, "Env:")?;
        for kv in &runtime.env {
            writeln!(f, "  {kv}")?;
        }
        if !runtime.labels.is_empty() {
            writeln!(f, "Labels:")?;
            for (k, v) in &runtime.labels {
                writeln!(f, "  {k}={v}")?;
            }
        }
        writeln!(f, "Layers:")?;
        let mut layers = self.manifest.layers.iter();
        for history in &self.config.history {
            if history.empty_layer {
                writeln!(f, "  {:<14} {}", "(metadata)", history.created_by)?;
            } else {
                let digest = layers
                    .next()
                    .map(|l| l.digest.trim_start_matches("sha256:").get(..12).unwrap_or("").to_string())
                    .unwrap_or_default();
                writeln!(f, "  {digest:<14} {}", history.created_by)?;
            }
        }
        Ok(())
    }
}

/// Write a tagged image as an OCI image layout directory.
pub fn export_oci_layout(store: &Store, reference: &ImageReference, dest: &Path) -> Result<()> {
    let image = inspect(store, reference)?;
    if dest.exists() && fs::read_dir(dest)?.next().is_some() {
        bail!("export directory '{}' is not empty", dest.display());
    }
    let blobs = dest.join("blobs/sha256");
    fs::create_dir_all(&blobs).with_context(|| format!("creating '{}'", blobs.display()))?;

    let manifest_hex = image.manifest_digest.trim_start_matches("sha256:").to_string();
    let mut hexes = vec![manifest_hex.clone(), image.manifest.config.hex()?.to_string()];
    for layer in &image.manifest.layers {
        hexes.push(layer.hex()?.to_string());
    }
    for hex in hexes {
        let src = store.blob_path(&hex)?;
        let dst = blobs.join(&hex);
        if dst.exists() {
            continue;
        }
        if fs::hard_link(&src, &dst).is_err() {
            fs::copy(&src, &dst)
                .with_context(|| format!("copying blob '{}' to '{}'", src.display(), dst.display()))?;
        }
    }

    fs::write(dest.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;

    let mut descriptor = Descriptor::new(MEDIA_TYPE_MANIFEST, &manifest_hex, image.manifest_size);
    descriptor
        .annotations
        .insert(ANNOTATION_REF_NAME.to_string(), reference.tag.clone());
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [descriptor],
    });
    fs::write(dest.join("index.json"), serde_json::to_vec_pretty(&index)?)?;

    tracing::info!(image = %reference, dest = %dest.display(), "exported OCI layout");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Protocol;

    #[test]
    fn config_serializes_with_oci_field_names() {
        let mut runtime = RuntimeConfig {
            env: vec!["PYTHONUNBUFFERED=1".into()],
            working_dir: Some("/app".into()),
            ..Default::default()
        };
        runtime.exposed_ports.insert("8000/tcp".into(), Empty {});
        let config = ImageConfig::new(runtime);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["config"]["ExposedPorts"]["8000/tcp"], serde_json::json!({}));
        assert_eq!(json["config"]["WorkingDir"], "/app");
        assert_eq!(json["rootfs"]["type"], "layers");
        assert!(json["config"].get("Cmd").is_none());
        assert!(json.get("created").is_none());

        let back: ImageConfig = serde_json::from_value(json).unwrap();
        assert!(back.config.exposes(&Port {
            number: 8000,
            protocol: Protocol::Tcp
        }));
        assert_eq!(back.config.env_value("PYTHONUNBUFFERED"), Some("1"));
    }

    #[test]
    fn manifest_uses_camel_case() {
        let manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_CONFIG, &"a".repeat(64), 10),
            vec![Descriptor::new(MEDIA_TYPE_LAYER_ZSTD, &"b".repeat(64), 20)],
        );
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["layers"][0]["mediaType"], MEDIA_TYPE_LAYER_ZSTD);
        assert_eq!(manifest.layers[0].hex().unwrap(), "b".repeat(64));
    }

    #[test]
    fn export_writes_a_complete_oci_layout() {
        use crate::store::{tmp_name, LayerWriter};
        use sha2::{Digest, Sha256};

        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("store")).unwrap();
        let src = tmp.path().join("app.py");
        fs::write(&src, "print('hi')\n").unwrap();
        let mut writer = LayerWriter::create(&store.tmp_dir().join(tmp_name("layer"))).unwrap();
        writer.append_file(Path::new("app/app.py"), 0o644, &src).unwrap();
        let layer = writer.finish().unwrap();
        let entry = store.put_layer(&"c".repeat(64), layer, BTreeMap::new()).unwrap();

        let mut config = ImageConfig::new(RuntimeConfig {
            working_dir: Some("/app".into()),
            ..Default::default()
        });
        config.rootfs.diff_ids = vec![format!("sha256:{}", entry.diff_id.clone().unwrap())];
        let (config_sha, config_size) = store.put_json_blob(&config).unwrap();
        let manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_CONFIG, &config_sha, config_size),
            vec![Descriptor::new(MEDIA_TYPE_LAYER_ZSTD, &entry.blob_sha256, entry.size_bytes)],
        );
        let (manifest_sha, manifest_size) = store.put_json_blob(&manifest).unwrap();
        let reference = ImageReference::parse_tag("hello:dev").unwrap();
        store.tag(&reference, &manifest_sha, manifest_size).unwrap();

        let dest = tmp.path().join("layout");
        export_oci_layout(&store, &reference, &dest).unwrap();

        let layout: serde_json::Value =
            serde_json::from_slice(&fs::read(dest.join("oci-layout")).unwrap()).unwrap();
        assert_eq!(layout["imageLayoutVersion"], "1.0.0");
        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(dest.join("index.json")).unwrap()).unwrap();
        let listed = &index["manifests"][0];
        assert_eq!(listed["annotations"][ANNOTATION_REF_NAME], "dev");
        assert_eq!(listed["digest"], format!("sha256:{manifest_sha}"));
        assert_eq!(listed["mediaType"], MEDIA_TYPE_MANIFEST);

        for hex in [&manifest_sha, &config_sha, &entry.blob_sha256] {
            let bytes = fs::read(dest.join("blobs/sha256").join(hex)).unwrap();
            assert_eq!(&format!("{:x}", Sha256::digest(&bytes)), hex);
        }

        let err = export_oci_layout(&store, &reference, &dest).unwrap_err();
        assert!(err.to_string().contains("is not empty"), "{err}");
    }
}
