use crate::models::InstanceReport;
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Erreurs de validation d'un rapport entrant. Renvoyées en 400 au producteur,
/// jamais propagées jusqu'au registre.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing or empty instance_id")]
    InvalidInstanceId,
    #[error("invalid field {0}: {1}")]
    InvalidField(&'static str, String),
}

impl ValidationError {
    /// Kind machine-readable exposé dans le corps de la réponse HTTP.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::InvalidInstanceId => "invalid_instance_id",
            ValidationError::InvalidField(..) => "invalid_field",
        }
    }
}

/// Valide et normalise un rapport brut. Les champs optionnels absents sont
/// coercés vers des défauts sûrs : gpu_count=0, gpu_available=false,
/// recent_hashrate = overall_hashrate, timestamp = maintenant.
/// Le body est pris en `serde_json::Value` pour que les champs mal typés
/// produisent notre propre kind d'erreur plutôt qu'un rejet serde opaque.
pub fn validate(raw: &Value) -> Result<InstanceReport, ValidationError> {
    // L'id est une clé opaque : gardé octet pour octet, seul le vide
    // (ou blanc) est rejeté.
    let instance_id = match raw.get("instance_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err(ValidationError::InvalidInstanceId),
    };

    let total_hashes = counter_field(raw, "total_hashes")?;
    let overall_hashrate = rate_field(raw, "overall_hashrate")?;
    let recent_hashrate = match raw.get("recent_hashrate") {
        None | Some(Value::Null) => overall_hashrate,
        Some(_) => rate_field(raw, "recent_hashrate")?,
    };
    let gpu_count = counter_field(raw, "gpu_count")?;
    let gpu_count = u32::try_from(gpu_count).unwrap_or(u32::MAX);

    let gpu_available = match raw.get("gpu_available") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(ValidationError::InvalidField(
                "gpu_available",
                format!("expected boolean, got {other}"),
            ))
        }
    };

    // Horodatage producteur : informatif uniquement, donc un format
    // inattendu est coercé vers maintenant plutôt que rejeté.
    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    Ok(InstanceReport {
        instance_id,
        total_hashes,
        overall_hashrate,
        recent_hashrate,
        gpu_count,
        gpu_available,
        timestamp,
    })
}

fn counter_field(raw: &Value, field: &'static str) -> Result<u64, ValidationError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                Ok(v)
            } else {
                Err(ValidationError::InvalidField(
                    field,
                    format!("expected non-negative integer, got {n}"),
                ))
            }
        }
        Some(other) => Err(ValidationError::InvalidField(
            field,
            format!("expected non-negative integer, got {other}"),
        )),
    }
}

fn rate_field(raw: &Value, field: &'static str) -> Result<f64, ValidationError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(ValidationError::InvalidField(
                field,
                format!("expected non-negative rate, got {n}"),
            )),
        },
        Some(other) => Err(ValidationError::InvalidField(
            field,
            format!("expected non-negative rate, got {other}"),
        )),
    }
}
