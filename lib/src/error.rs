use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{call}() failed ({code})")]
pub struct RuntimeError {
    pub call: &'static str,
    pub code: String,
}

impl RuntimeError {
    pub fn new<S: ToString>(call: &'static str, code: S) -> Self {
        Self {
            call,
            code: code.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("no XR runtime available: {0}")]
    NoRuntime(String),
    #[error("no XR device found, make sure the headset is connected: {0}")]
    NoDevice(RuntimeError),
    #[error("graphics context rejected: {0}")]
    Graphics(String),
    #[error("no usable color swapchain format")]
    NoColorFormat,
    #[error("{what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: RuntimeError,
    },
}

impl InitError {
    pub fn resource(what: &'static str) -> impl FnOnce(RuntimeError) -> Self {
        move |source| Self::Resource { what, source }
    }
}
