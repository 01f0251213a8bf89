//! Vulnerability matcher output parsing.
//!
//! Expects a JSON document with a `matches` array, each entry shaped as
//! `{vulnerability: {id, severity, fix: {versions}}, artifact: {name, version}}`.
//! Missing fields default to empty values rather than failing the whole document.

use serde::Deserialize;

use super::{Finding, Severity};

#[derive(Debug, Deserialize)]
struct MatcherOutput {
    #[serde(default)]
    matches: Vec<MatcherMatch>,
}

#[derive(Debug, Deserialize)]
struct MatcherMatch {
    #[serde(default)]
    vulnerability: MatchedVulnerability,
    #[serde(default)]
    artifact: MatchedArtifact,
}

#[derive(Debug, Default, Deserialize)]
struct MatchedVulnerability {
    #[serde(default)]
    id: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    fix: Option<MatchedFix>,
}

#[derive(Debug, Default, Deserialize)]
struct MatchedFix {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MatchedArtifact {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

/// Parse matcher output into findings, one per match, in document order.
pub fn parse_findings(document: &[u8]) -> Result<Vec<Finding>, serde_json::Error> {
    let output: MatcherOutput = serde_json::from_slice(document)?;
    Ok(output.matches.into_iter().map(convert_match).collect())
}

fn convert_match(m: MatcherMatch) -> Finding {
    Finding {
        vulnerability_id: m.vulnerability.id,
        severity: m.vulnerability.severity.as_deref().map(Severity::parse).unwrap_or_default(),
        package_name: m.artifact.name,
        installed_version: m.artifact.version,
        fixed_in: m.vulnerability.fix.map(|f| f.versions).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches() {
        let output = br#"{
            "matches": [
                {
                    "vulnerability": {
                        "id": "CVE-2024-12345",
                        "severity": "Critical",
                        "fix": {"versions": ["3.0.13", "3.1.5"], "state": "fixed"}
                    },
                    "artifact": {"name": "openssl", "version": "3.0.2", "type": "deb"}
                },
                {
                    "vulnerability": {"id": "GHSA-xxxx-yyyy", "severity": "Negligible"},
                    "artifact": {"name": "bash", "version": "5.1"}
                },
                {
                    "vulnerability": {
                        "id": "CVE-2023-1", "severity": "low", "fix": {"versions": []}
                    },
                    "artifact": {"name": "zlib", "version": "1.2.13"}
                }
            ],
            "source": {"type": "sbom"}
        }"#;

        let findings = parse_findings(output).unwrap();
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].vulnerability_id, "CVE-2024-12345");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].package_name, "openssl");
        assert_eq!(findings[0].installed_version, "3.0.2");
        assert_eq!(findings[0].fixed_in, vec!["3.0.13", "3.1.5"]);

        assert_eq!(findings[1].severity, Severity::Unknown);
        assert!(findings[1].fixed_in.is_empty());

        assert_eq!(findings[2].severity, Severity::Low);
    }

    #[test]
    fn test_no_matches() {
        assert!(parse_findings(br#"{"matches": []}"#).unwrap().is_empty());
        assert!(parse_findings(br#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_missing_severity_is_unknown() {
        let findings =
            parse_findings(br#"{"matches": [{"vulnerability": {"id": "CVE-9"}, "artifact": {}}]}"#)
                .unwrap();
        assert_eq!(findings[0].severity, Severity::Unknown);
        assert_eq!(findings[0].package_name, "");
    }

    #[test]
    fn test_truncated_document_is_an_error() {
        assert!(parse_findings(br#"{"matches": [{"vulnerability": "#).is_err());
    }
}
