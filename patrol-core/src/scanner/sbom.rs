//! SBOM document parsing.
//!
//! Only the `artifacts` array of the generator's JSON output is relied upon.

use serde::de::IgnoredAny;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SbomDocument {
    #[serde(default)]
    artifacts: Vec<IgnoredAny>,
}

/// Count the packages listed in an SBOM document.
///
/// A document without an `artifacts` key has zero packages.
pub fn count_packages(document: &[u8]) -> Result<u64, serde_json::Error> {
    let sbom: SbomDocument = serde_json::from_slice(document)?;
    Ok(sbom.artifacts.len() as u64)
}
