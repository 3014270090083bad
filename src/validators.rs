use anyhow::{anyhow, Result};

pub fn validate_id_scope(id_scope: &str) -> Result<()> {
    if id_scope.is_empty() {
        return Err(anyhow!("ID scope cannot be empty"));
    }
    if id_scope.len() > 64 {
        return Err(anyhow!("ID scope must be 64 characters or less"));
    }
    if !id_scope.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("ID scope must be alphanumeric"));
    }
    Ok(())
}

pub fn validate_registration_id(registration_id: &str) -> Result<()> {
    if registration_id.is_empty() {
        return Err(anyhow!("Registration ID cannot be empty"));
    }
    if registration_id.len() > 128 {
        return Err(anyhow!("Registration ID must be 128 characters or less"));
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | ':');
    if !registration_id.chars().all(allowed) {
        return Err(anyhow!(
            "Registration ID may only contain lowercase letters, digits and '-', '.', '_', ':'"
        ));
    }
    Ok(())
}

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(anyhow!("Filename cannot be empty"));
    }
    if filename.contains("..") {
        return Err(anyhow!("Filename cannot contain '..'"));
    }
    if filename.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
        return Err(anyhow!("Filename contains invalid characters"));
    }
    if filename.len() > 128 {
        return Err(anyhow!("Filename must be 128 characters or less"));
    }
    Ok(())
}

/// A firmware image name: a bare file name carrying the image extension.
pub fn validate_image_name(filename: &str, extension: &str) -> Result<()> {
    validate_filename(filename)?;
    if !has_extension(filename, extension) {
        return Err(anyhow!("Firmware image must end in .{}", extension));
    }
    Ok(())
}

/// Firmware images are only ever fetched over TLS.
pub fn validate_firmware_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| anyhow!("Firmware URL must use https"))?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(anyhow!("Firmware URL has no host"));
    }
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(anyhow!("Firmware URL contains whitespace"));
    }
    Ok(())
}

pub fn has_extension(filename: &str, extension: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
