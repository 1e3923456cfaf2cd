use crate::{APP_NAME, APP_VERSION_MAJOR, APP_VERSION_MINOR, APP_VERSION_PATCH};
use crate::session::ReferenceType;

pub const ENGINE_NAME: &str = "xrlink";

#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    pub preferred_reference: ReferenceType,
    // Depth swapchains if supported, else a local depth buffer per view.
    pub depth_submission: bool,
}

impl Config {
    pub fn with_app_name<S: AsRef<str>>(mut self, app_name: S) -> Self {
        self.app_name = app_name.as_ref().to_string();
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        let version = pack_version(APP_VERSION_MAJOR, APP_VERSION_MINOR, APP_VERSION_PATCH);

        Self {
            app_name: APP_NAME.to_string(),
            app_version: version,
            engine_name: ENGINE_NAME.to_string(),
            engine_version: version,
            preferred_reference: ReferenceType::LocalFloor,
            depth_submission: true,
        }
    }
}

fn pack_version(major: &str, minor: &str, patch: &str) -> u32 {
    // Malformed components pack as 0, the version is informational only.

    let major: u8 = major.parse().unwrap_or(0);
    let minor: u8 = minor.parse().unwrap_or(0);
    let patch: u8 = patch.parse().unwrap_or(0);

    (major as u32) << 24 | (minor as u32) << 16 | patch as u32
}
