//! CNI config artifacts.
//!
//! The CNI config for an instance is rendered from a packaged template by
//! substituting the node's host subnet and the cluster service CIDR. The
//! result lives in a temporary file only long enough for the agent to copy
//! it to the instance.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nodecfg_networking::Cidr;
use thiserror::Error;
use tracing::{debug, warn};

/// Placeholder replaced by the cluster service CIDR.
pub const SERVICE_CIDR_PLACEHOLDER: &str = "{{.ServiceCIDR}}";

/// Placeholder replaced by the node's host subnet.
pub const HOST_SUBNET_PLACEHOLDER: &str = "{{.HostSubnet}}";

/// Default location of the packaged template.
pub const DEFAULT_CNI_TEMPLATE_PATH: &str = "/payload/cni/cni-conf-template.json";

/// CNI artifact errors.
#[derive(Debug, Error)]
pub enum CniError {
    /// The template could not be read.
    #[error("failed to read CNI template {}", .path.display())]
    ReadTemplate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The rendered config could not be written.
    #[error("failed to write CNI config artifact")]
    WriteArtifact(#[source] io::Error),
}

/// Substitute both placeholders in `template`.
pub fn render(template: &str, service_cidr: &Cidr, host_subnet: &Cidr) -> String {
    template
        .replace(SERVICE_CIDR_PLACEHOLDER, &service_cidr.to_string())
        .replace(HOST_SUBNET_PLACEHOLDER, &host_subnet.to_string())
}

/// Render the template at `template_path` into a fresh temporary file and
/// return its path. The caller owns the file and must hand it to
/// [`cleanup`].
pub fn materialize(
    service_cidr: &Cidr,
    host_subnet: &Cidr,
    template_path: &Path,
) -> Result<PathBuf, CniError> {
    let template = fs::read_to_string(template_path).map_err(|source| CniError::ReadTemplate {
        path: template_path.to_path_buf(),
        source,
    })?;

    let rendered = render(&template, service_cidr, host_subnet);

    let mut file = tempfile::Builder::new()
        .prefix("cni-")
        .suffix(".conf")
        .tempfile()
        .map_err(CniError::WriteArtifact)?;
    file.write_all(rendered.as_bytes())
        .map_err(CniError::WriteArtifact)?;
    let (_, path) = file.keep().map_err(|e| CniError::WriteArtifact(e.error))?;

    debug!(path = %path.display(), "Materialized CNI config");
    Ok(path)
}

/// Delete a CNI artifact. Failure is logged, never returned.
pub fn cleanup(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed CNI config"),
        Err(e) => warn!(path = %path.display(), error = %e, "Error deleting temp CNI config"),
    }
}
