//! I/O utilities.
//!
//! Config files may be JSON or TOML, and outputs may go to a file or to
//! standard output. We keep the format sniffing in one place.

use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite},
};

use crate::prelude::*;

/// Does this path look like it holds JSON?
fn is_json_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Read TOML or JSON from a file, based on the file extension.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open file at path: {:?}", path))?;
    let mut data = String::new();
    // Read all at once because our parsing libraries don't do async I/O.
    file.read_to_string(&mut data)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    if is_json_path(path) {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create directory {:?}", parent)
                })?;
            }
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn reads_json_and_toml_by_extension() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("io")?;
        let json_path = dir.path().join("value.json");
        let toml_path = dir.path().join("value.toml");
        tokio::fs::write(&json_path, r#"{"rows": 4}"#).await?;
        tokio::fs::write(&toml_path, "rows = 5\n").await?;

        let json: BTreeMap<String, u32> = read_json_or_toml(&json_path).await?;
        let toml: BTreeMap<String, u32> = read_json_or_toml(&toml_path).await?;
        assert_eq!(json["rows"], 4);
        assert_eq!(toml["rows"], 5);
        Ok(())
    }

    #[tokio::test]
    async fn create_writer_creates_parent_directories() -> Result<()> {
        use tokio::io::AsyncWriteExt as _;

        let dir = tempfile::TempDir::with_prefix("io")?;
        let path = dir.path().join("nested/out.txt");
        let mut wtr = create_writer(Some(&path)).await?;
        wtr.write_all(b"hello").await?;
        wtr.flush().await?;
        drop(wtr);
        assert_eq!(tokio::fs::read_to_string(&path).await?, "hello");
        Ok(())
    }
}
