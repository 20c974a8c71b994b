//! Shared resource-spec parsing/validation (§4.1), used by every backend so
//! the Kubernetes `m`-suffix rejection lives in exactly one place.

use serde::{Deserialize, Serialize};

use super::DriverError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpus: f64,
    pub memory: String,
    #[serde(default)]
    pub disk: Option<String>,
}

/// A memory quantity parsed into bytes, retaining enough of the original
/// unit to re-render it for the backend that needs it (Docker wants bytes,
/// Kubernetes wants `Mi`/`Gi` quantity strings).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBytes(pub u64);

impl MemoryBytes {
    pub fn as_kube_quantity(&self) -> String {
        format!("{}Mi", self.0 / (1024 * 1024))
    }
}

/// Parses a `memory` string like `"256m"`, `"1g"`, `"512Mi"`, `"2Gi"`.
///
/// `for_kubernetes` rejects bare `m`/`M` (mebibyte shorthand), since on
/// Kubernetes a bare `m` suffix means milli-bytes, not mebibytes — a request
/// for `"512m"` there is silently a request for half a byte.
pub fn parse_memory(raw: &str, for_kubernetes: bool) -> Result<MemoryBytes, DriverError> {
    let raw = raw.trim();
    let (digits, suffix) = raw
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| raw.split_at(i))
        .unwrap_or((raw, ""));

    let value: f64 = digits
        .parse()
        .map_err(|_| DriverError::InvalidSpec(format!("invalid memory quantity: '{raw}'")))?;

    let bytes = match suffix {
        "Mi" => value * 1024.0 * 1024.0,
        "Gi" => value * 1024.0 * 1024.0 * 1024.0,
        "m" | "M" if for_kubernetes => {
            return Err(DriverError::InvalidSpec(format!(
                "Kubernetes memory must use 'Mi'/'Gi' suffixes, not '{suffix}' (bare 'm' means milli-bytes on Kubernetes): '{raw}'"
            )));
        }
        "m" | "M" => value * 1024.0 * 1024.0,
        "g" | "G" => value * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(DriverError::InvalidSpec(format!(
                "unrecognized memory unit '{other}' in '{raw}'"
            )));
        }
    };

    Ok(MemoryBytes(bytes.round() as u64))
}

/// Validates the full spec for a given backend, returning the parsed memory
/// quantity on success.
pub fn validate_resource_spec(
    spec: &ResourceSpec,
    for_kubernetes: bool,
) -> Result<MemoryBytes, DriverError> {
    if spec.cpus <= 0.0 {
        return Err(DriverError::InvalidSpec(format!(
            "cpus must be positive, got {}",
            spec.cpus
        )));
    }
    parse_memory(&spec.memory, for_kubernetes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_docker_mebibyte_shorthand() {
        let parsed = parse_memory("256m", false).unwrap();
        assert_eq!(parsed.0, 256 * 1024 * 1024);
    }

    #[test]
    fn rejects_bare_m_on_kubernetes() {
        let err = parse_memory("512m", true).unwrap_err();
        assert!(matches!(err, DriverError::InvalidSpec(_)));
    }

    #[test]
    fn accepts_kubernetes_mi_gi() {
        assert_eq!(parse_memory("512Mi", true).unwrap().0, 512 * 1024 * 1024);
        assert_eq!(parse_memory("2Gi", true).unwrap().0, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_non_positive_cpus() {
        let spec = ResourceSpec {
            cpus: 0.0,
            memory: "256m".into(),
            disk: None,
        };
        assert!(validate_resource_spec(&spec, false).is_err());
    }

    #[test]
    fn kube_quantity_round_trips_megabytes() {
        let mem = parse_memory("512Mi", true).unwrap();
        assert_eq!(mem.as_kube_quantity(), "512Mi");
    }
}
