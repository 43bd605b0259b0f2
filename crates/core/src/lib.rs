pub mod config;
pub mod imagebuild;
pub mod reference;

pub use config::{AmqpConfig, BuildkitConfig, ConfigError, KilnConfig, LoggingConfig, MessagingConfig};
pub use imagebuild::{
    AmqpOverrides, ImageBuild, ImageBuildSpec, ImageBuildStatus, ObjectMeta, Phase,
    PhaseTransition,
};
pub use reference::{normalize_image, ImageReference, ReferenceError};
