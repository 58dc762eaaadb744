use std::path::Path;

/// Deletes `path` if it exists and re-creates it empty.
pub async fn clean_dir(path: &Path) -> std::io::Result<()> {
  match tokio::fs::remove_dir_all(path).await {
    Ok(()) => {}
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
    Err(err) => return Err(err),
  }

  tokio::fs::create_dir_all(path).await
}

pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}
