//! Container image references in familiar form.
//!
//! Parsing is delegated to `oci_distribution`; the Docker Hub domain and the
//! `library/` namespace it implies are dropped again, so `myrepo/app` stays
//! `myrepo/app` and `nginx` stays `nginx`.

use oci_distribution::{ParseError, Reference};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_TAG: &str = "latest";
const DOCKER_HUB_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A parsed `[domain/]path[:tag][@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    domain: Option<String>,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let reference = Reference::try_from(input)?;
        Ok(Self::familiar(&reference))
    }

    fn familiar(reference: &Reference) -> Self {
        let (domain, path) = if reference.registry() == DOCKER_HUB_DOMAIN {
            let path = reference.repository();
            let path = path.strip_prefix(OFFICIAL_REPO_PREFIX).unwrap_or(path);
            (None, path.to_string())
        } else {
            (
                Some(reference.registry().to_string()),
                reference.repository().to_string(),
            )
        };

        Self {
            domain,
            path,
            tag: reference.tag().map(str::to_string),
            digest: reference.digest().map(str::to_string),
        }
    }

    /// Repository name without tag or digest.
    pub fn name(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}/{}", domain, self.path),
            None => self.path.clone(),
        }
    }

    /// Registry domain, `None` for Docker Hub.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Adds the `latest` tag when the reference has neither a tag nor a digest.
    pub fn with_default_tag(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses `image` and returns it with the default tag applied.
pub fn normalize_image(image: &str) -> Result<String, ReferenceError> {
    Ok(ImageReference::parse(image)?.with_default_tag().to_string())
}
