pub mod action;
pub use action::{ActionId, ActionState, ActionType, Component, Hand, BASELINE_PROFILE};

pub mod config;
pub use config::Config;

pub mod error;
pub use error::{InitError, RuntimeError};

mod frame;

pub mod pose;
pub use pose::{Pose, ReferenceFrame};

pub mod projection;
pub use projection::ClipSpace;

pub mod renderer;
pub use renderer::Renderer;

pub mod runtime;
pub use runtime::Runtime;

pub mod session;
pub use session::{Lifecycle, ReferenceType, Session, XrState};

pub mod util;

#[cfg(test)]
mod tests;

pub const APP_NAME: &str = env!("CARGO_PKG_DESCRIPTION");
pub const APP_VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const APP_VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const APP_VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
