use ci_runner::Result;
use std::path::Path;
use tokio::{fs, io::AsyncWriteExt};

pub async fn create_executable_file(file_path: &Path, content: &str) -> Result<()> {
  if let Some(parent) = file_path.parent() {
    fs::create_dir_all(parent).await?;
  }

  let mut file;
  #[cfg(unix)]
  {
    file = fs::OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .mode(0o755)
      .open(file_path)
      .await?;
  }
  #[cfg(not(unix))]
  {
    file = fs::File::create(file_path).await?;
  }

  file.write_all(b"#!/bin/sh\nset -e\n").await?;
  file.write_all(content.as_bytes()).await?;
  file.write_all(b"\n").await?;
  file.flush().await?;

  // Fix Text file busy
  drop(file);

  Ok(())
}

/// Single-quotes `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}

/// Container-name friendly form of `value`.
pub fn container_name(value: &str) -> String {
  value
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c.to_ascii_lowercase()
      } else {
        '-'
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_shell_quote() {
    assert_eq!(shell_quote("plain"), "'plain'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
  }

  #[test]
  fn test_container_name() {
    assert_eq!(container_name("ci-step-1_Run Tests"), "ci-step-1_run-tests");
  }

  #[ci_runner_test::test(unix)]
  async fn test_create_executable_file() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("step.sh");

    create_executable_file(&path, "echo hi").await.unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "#!/bin/sh\nset -e\necho hi\n");
    assert_eq!(
      std::fs::metadata(&path).unwrap().permissions().mode() & 0o111,
      0o111
    );
  }
}
