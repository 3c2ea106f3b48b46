//! Artifact Format Detection
//!
//! Infers the container format of a model artifact. Signals are consulted
//! strongest first:
//!
//! 1. Magic bytes at the start of the file
//! 2. Sentinel files inside a directory-structured package
//! 3. File extension, only when nothing stronger matched
//!
//! Detection never fails: malformed or truncated input yields
//! [`ArtifactFormat::Unknown`]. Callers are expected to run detection on
//! finalized artifacts only.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

/// Number of leading bytes the detector needs
pub const HEADER_SNIFF_BYTES: usize = 16;

/// Sentinel file marking a Core ML `.mlpackage` directory
pub const MLPACKAGE_MANIFEST: &str = "Manifest.json";

/// SafeTensors caps its JSON header at 100 MB
const SAFETENSORS_MAX_HEADER: u64 = 100 * 1024 * 1024;

/// ModelProto field tags that can follow `ir_version` in an ONNX file
const ONNX_FOLLOWING_TAGS: [u8; 8] = [0x12, 0x1a, 0x22, 0x28, 0x32, 0x3a, 0x42, 0x72];

/// Declared or detected container format of an artifact
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// ONNX protobuf model
    Onnx,
    /// llama.cpp GGUF container
    Gguf,
    /// Hugging Face SafeTensors
    Safetensors,
    /// TensorFlow Lite flatbuffer
    Tflite,
    /// Core ML package directory
    MlPackage,
    /// Not recognized
    #[default]
    Unknown,
}

impl ArtifactFormat {
    /// All concrete formats (excludes `Unknown`)
    pub const KNOWN: [Self; 5] = [
        Self::Onnx,
        Self::Gguf,
        Self::Safetensors,
        Self::Tflite,
        Self::MlPackage,
    ];

    /// Canonical file extension, without the dot
    #[must_use]
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Onnx => Some("onnx"),
            Self::Gguf => Some("gguf"),
            Self::Safetensors => Some("safetensors"),
            Self::Tflite => Some("tflite"),
            Self::MlPackage => Some("mlpackage"),
            Self::Unknown => None,
        }
    }

    /// Whether this artifact is a directory rather than a single file
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::MlPackage)
    }

    /// Whether this is a concrete format
    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Onnx => "ONNX",
            Self::Gguf => "GGUF",
            Self::Safetensors => "SAFETENSORS",
            Self::Tflite => "TFLITE",
            Self::MlPackage => "MLPACKAGE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

impl FromStr for ArtifactFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "gguf" => Ok(Self::Gguf),
            "safetensors" => Ok(Self::Safetensors),
            "tflite" => Ok(Self::Tflite),
            "mlpackage" => Ok(Self::MlPackage),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unrecognized artifact format '{other}'")),
        }
    }
}

/// Detect a format from leading file bytes
#[must_use]
pub fn detect_header(header: &[u8]) -> ArtifactFormat {
    if header.starts_with(b"GGUF") {
        return ArtifactFormat::Gguf;
    }
    if header.get(4..8) == Some(b"TFL3".as_slice()) {
        return ArtifactFormat::Tflite;
    }
    if is_safetensors_header(header) {
        return ArtifactFormat::Safetensors;
    }
    if is_onnx_header(header) {
        return ArtifactFormat::Onnx;
    }
    ArtifactFormat::Unknown
}

fn is_safetensors_header(header: &[u8]) -> bool {
    let Some(len_bytes) = header.get(0..8) else {
        return false;
    };
    let mut raw = [0u8; 8];
    raw.copy_from_slice(len_bytes);
    let header_len = u64::from_le_bytes(raw);
    header_len > 1 && header_len <= SAFETENSORS_MAX_HEADER && header.get(8) == Some(&b'{')
}

fn is_onnx_header(header: &[u8]) -> bool {
    // Field 1 (ir_version, varint) as a single-byte varint, then another
    // ModelProto field
    match header {
        [0x08, version, next, ..] => {
            (1..=0x20).contains(version) && ONNX_FOLLOWING_TAGS.contains(next)
        }
        _ => false,
    }
}

/// Detect a directory-structured package from its entry names
#[must_use]
pub fn detect_directory<S: AsRef<str>>(entries: &[S]) -> ArtifactFormat {
    if entries
        .iter()
        .any(|e| e.as_ref().eq_ignore_ascii_case(MLPACKAGE_MANIFEST))
    {
        return ArtifactFormat::MlPackage;
    }
    ArtifactFormat::Unknown
}

/// Detect a format from a file name or URL path
#[must_use]
pub fn detect_extension(name: &str) -> ArtifactFormat {
    // Ignore query strings and fragments on URLs
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let path = path.trim_end_matches('/');
    let Some((_, ext)) = path.rsplit_once('.') else {
        return ArtifactFormat::Unknown;
    };
    if ext.contains('/') {
        return ArtifactFormat::Unknown;
    }
    ArtifactFormat::KNOWN
        .into_iter()
        .find(|f| f.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(ArtifactFormat::Unknown)
}

/// Combine all signals in priority order
///
/// `listing` is only consulted when the artifact is a directory.
#[must_use]
pub fn detect_format<S: AsRef<str>>(
    header: &[u8],
    listing: Option<&[S]>,
    name_hint: Option<&str>,
) -> ArtifactFormat {
    let by_magic = detect_header(header);
    if by_magic.is_known() {
        return by_magic;
    }
    if let Some(entries) = listing {
        let by_layout = detect_directory(entries);
        if by_layout.is_known() {
            return by_layout;
        }
    }
    name_hint.map_or(ArtifactFormat::Unknown, detect_extension)
}

/// Detect the format of a file or directory on disk
///
/// Any I/O failure yields `Unknown`.
pub async fn detect_path(path: &Path, name_hint: Option<&str>) -> ArtifactFormat {
    let hint = name_hint
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()));

    let Ok(meta) = tokio::fs::metadata(path).await else {
        return ArtifactFormat::Unknown;
    };

    if meta.is_dir() {
        let mut names = Vec::new();
        if let Ok(mut dir) = tokio::fs::read_dir(path).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        return detect_format(&[], Some(names.as_slice()), hint.as_deref());
    }

    let mut header = Vec::with_capacity(HEADER_SNIFF_BYTES);
    if let Ok(file) = tokio::fs::File::open(path).await {
        let _ = file
            .take(HEADER_SNIFF_BYTES as u64)
            .read_to_end(&mut header)
            .await;
    }
    detect_format::<&str>(&header, None, hint.as_deref())
}
