// Twin-driven firmware update.
//
// Update flow:
// 1. Compare desired CodeVersion with the running version
// 2. Report "Updating..." while the session is still open
// 3. Close the session to free memory for the transfer
// 4. Replace the stored image with the one at the desired Firmware URL
// 5. Verify the image and hand a restart request to the caller

pub mod controller;

pub use controller::{OtaController, OtaPolicy, StepOutcome};

use std::path::PathBuf;

use crate::error::ErrorKind;

pub const UPDATING_MESSAGE: &str = "Updating...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaState {
    #[default]
    Idle,
    CheckingVersion,
    Updating(UpdatePhase),
    RestartPending,
    Failed,
}

impl OtaState {
    pub fn is_updating(&self) -> bool {
        matches!(self, OtaState::Updating(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Reporting,
    ConnectionClosing,
    Downloading,
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Reporting,
    Downloading,
    Verifying,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdateJob {
    pub target_version: i64,
    pub source_url: String,
    pub local_file_name: String,
    pub status: JobStatus,
    pub last_error: Option<ErrorKind>,
}

/// A verified image waiting for the platform to reboot into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub target_version: i64,
    pub image_path: PathBuf,
    pub image_len: u64,
    pub sha256: String,
}

/// Local file name for a firmware URL: the last path segment, without query
/// or fragment.
pub fn image_name_from_url(url: &str) -> Option<&str> {
    let without_query = url.split(|c: char| c == '?' || c == '#').next()?;
    let (_, path) = without_query.strip_prefix("https://")?.split_once('/')?;
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_is_last_path_segment() {
        assert_eq!(image_name_from_url("https://cdn.example.com/fw/v3.bin"), Some("v3.bin"));
        assert_eq!(image_name_from_url("https://cdn.example.com/v3.bin?sig=abc#x"), Some("v3.bin"));
    }

    #[test]
    fn url_without_file_has_no_image_name() {
        assert_eq!(image_name_from_url("https://cdn.example.com"), None);
        assert_eq!(image_name_from_url("https://cdn.example.com/fw/"), None);
        assert_eq!(image_name_from_url("http://cdn.example.com/v3.bin"), None);
    }
}
