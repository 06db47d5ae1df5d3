use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub mod buffer3;
pub mod float_ext;
pub mod parallel;

pub use buffer3::Buffer3;
pub use float_ext::FloatExt;

pub const EPSILON: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum FileExtensionError {
    #[error("Failed to get file extension")]
    MissingFileExtension,
    #[error("Unsupported file extension for file: {0}")]
    UnsupportedFileExtension(String),
}

pub type FileFormatResult<T> = Result<T, FileExtensionError>;

#[derive(Debug, thiserror::Error)]
pub enum SerdeFormatError {
    #[error("YAML serialization failed")]
    Yaml(#[from] serde_yml::Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
}

pub type SerdeFormatResult<T> = Result<T, SerdeFormatError>;

pub fn get_file_extension(filename: &str) -> Option<&str> {
    Path::new(filename)
        .extension()
        .and_then(|os_str| os_str.to_str())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    pub fn from_file_name(file_name: &str) -> FileFormatResult<Self> {
        let extension = get_file_extension(file_name)
            .map(|ext| ext.to_ascii_lowercase())
            .ok_or(FileExtensionError::MissingFileExtension)?;

        match extension.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(FileExtensionError::UnsupportedFileExtension(
                file_name.to_string(),
            )),
        }
    }
}

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}

pub fn serialize<T: Serialize>(value: &T, format: FileFormat) -> SerdeFormatResult<String> {
    let mut text = match format {
        FileFormat::Yaml => serde_yml::to_string(value)?,
        FileFormat::Json => to_json_indented(value)?,
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }

    Ok(text)
}

pub fn deserialize<T: DeserializeOwned>(
    serialized: &str,
    format: FileFormat,
) -> SerdeFormatResult<T> {
    match format {
        FileFormat::Yaml => Ok(serde_yml::from_str(serialized)?),
        FileFormat::Json => Ok(serde_json::from_str(serialized)?),
    }
}

/// Pretty JSON with a four space indent.
pub fn to_json_indented<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;

    // serde_json only ever emits valid UTF-8
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn file_format_from_extension() {
        assert_eq!(FileFormat::from_file_name("a.yml").unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_file_name("a.YAML").unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_file_name("cfg.json").unwrap(), FileFormat::Json);
        assert!(matches!(
            FileFormat::from_file_name("noext"),
            Err(FileExtensionError::MissingFileExtension)
        ));
        assert!(matches!(
            FileFormat::from_file_name("a.lua"),
            Err(FileExtensionError::UnsupportedFileExtension(_))
        ));
    }

    #[test]
    fn serialize_roundtrip_formats() -> anyhow::Result<()> {
        let sample = Sample {
            name: "rag".to_string(),
            values: vec![1, 2, 3],
        };

        for format in [FileFormat::Yaml, FileFormat::Json] {
            let text = serialize(&sample, format)?;
            assert!(text.ends_with('\n'));
            let back: Sample = deserialize(&text, format)?;
            assert_eq!(back, sample);
        }

        Ok(())
    }

    #[test]
    fn json_uses_four_space_indent() -> anyhow::Result<()> {
        let text = to_json_indented(&Sample {
            name: "x".to_string(),
            values: vec![],
        })?;
        assert!(text.contains("\n    \"name\": \"x\""));
        Ok(())
    }
}
