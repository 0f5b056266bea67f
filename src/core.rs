//! Core data types shared by the dispatcher and the workflow executor.
//!
//! # Data Flow
//!
//! ```text
//! UnitOperationRequest --parse--> UnitOperation --dispatch--> ExperimentResult
//! ```
//!
//! A request arrives with a free-form `uo_type` string. Parsing resolves it to a
//! closed [`Technique`]; the dispatcher then stamps the measurement data returned
//! by a backend with identity and time to produce an [`ExperimentResult`].

use crate::error::{AppResult, EchemError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Raw parameter or data map as it travels over JSON.
pub type JsonMap = Map<String, Value>;

// =============================================================================
// Techniques
// =============================================================================

/// Electrochemical techniques with a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Technique {
    /// Cyclic voltammetry
    Cva,
    /// Potentiostatic electrochemical impedance spectroscopy
    Peis,
    /// Open circuit voltage
    Ocv,
    /// Chronopotentiometry
    Cp,
    /// Linear sweep voltammetry
    Lsv,
}

impl Technique {
    /// Every technique, in registration order.
    pub const ALL: [Technique; 5] = [
        Technique::Cva,
        Technique::Peis,
        Technique::Ocv,
        Technique::Cp,
        Technique::Lsv,
    ];

    /// Canonical upper-case name used in ids and persisted results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Cva => "CVA",
            Technique::Peis => "PEIS",
            Technique::Ocv => "OCV",
            Technique::Cp => "CP",
            Technique::Lsv => "LSV",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = EchemError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CVA" | "CV" => Ok(Technique::Cva),
            "PEIS" | "EIS" => Ok(Technique::Peis),
            "OCV" => Ok(Technique::Ocv),
            "CP" => Ok(Technique::Cp),
            "LSV" => Ok(Technique::Lsv),
            _ => Err(EchemError::UnknownTechnique(raw.to_string())),
        }
    }
}

// =============================================================================
// Unit operations
// =============================================================================

/// Submission payload accepted from callers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnitOperationRequest {
    /// Technique name, e.g. `"CVA"`.
    #[serde(default)]
    pub uo_type: String,
    /// Raw, possibly unit-suffixed parameters.
    #[serde(default)]
    pub parameters: JsonMap,
    /// Caller metadata, persisted alongside results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

impl UnitOperationRequest {
    /// Builds a request from a technique name and a parameter map.
    pub fn new(uo_type: impl Into<String>, parameters: JsonMap) -> Self {
        Self {
            uo_type: uo_type.into(),
            parameters,
            metadata: None,
        }
    }
}

/// A request whose technique has been resolved.
#[derive(Clone, Debug, Serialize)]
pub struct UnitOperation {
    /// Resolved technique.
    pub technique: Technique,
    /// Raw parameters, normalised later by the backend.
    pub parameters: JsonMap,
    /// Assigned by the dispatcher.
    pub experiment_id: Option<String>,
    /// Caller metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

impl UnitOperation {
    /// Creates an operation for a known technique.
    pub fn new(technique: Technique, parameters: JsonMap) -> Self {
        Self {
            technique,
            parameters,
            experiment_id: None,
            metadata: None,
        }
    }

    /// Resolves the technique named by a request.
    pub fn from_request(request: &UnitOperationRequest) -> AppResult<Self> {
        if request.uo_type.trim().is_empty() {
            return Err(EchemError::parse("uo_type", "Missing uo_type"));
        }
        let technique = request.uo_type.parse()?;
        Ok(Self {
            technique,
            parameters: request.parameters.clone(),
            experiment_id: None,
            metadata: request.metadata.clone(),
        })
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a unit operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    #[allow(missing_docs)]
    Success,
    #[allow(missing_docs)]
    Error,
}

/// Classification of a failed result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Parse,
    Validation,
    UnknownType,
    Connection,
    Measurement,
    Upload,
    SafetyAbort,
    Cancelled,
    Internal,
}

/// Result of one unit operation as returned to callers and persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Absent when the request failed before an id was issued.
    pub experiment_id: Option<String>,
    /// Technique name as submitted or resolved.
    pub uo_type: String,
    /// Success or error.
    pub status: ResultStatus,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Measurement payload.
    #[serde(default)]
    pub data: JsonMap,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

impl ExperimentResult {
    /// A successful result carrying measurement data.
    pub fn success(uo_type: impl Into<String>, data: JsonMap) -> Self {
        Self {
            experiment_id: None,
            uo_type: uo_type.into(),
            status: ResultStatus::Success,
            message: None,
            error_kind: None,
            data,
            timestamp: Utc::now(),
        }
    }

    /// An error result describing `err`.
    pub fn failure(uo_type: impl Into<String>, err: &EchemError) -> Self {
        Self {
            experiment_id: None,
            uo_type: uo_type.into(),
            status: ResultStatus::Error,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            data: JsonMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attaches the dispatcher-issued id.
    pub fn with_id(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    #[allow(missing_docs)]
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Lifecycle of an experiment known to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ExperimentStatus {
    Running,
    Completed,
    Failed,
}

/// Reply to a submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    /// Mirrors the result status.
    pub status: ResultStatus,
    /// Issued id, if any.
    pub experiment_id: Option<String>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ExperimentResult> for SubmissionResponse {
    fn from(result: &ExperimentResult) -> Self {
        Self {
            status: result.status,
            experiment_id: result.experiment_id.clone(),
            message: result.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_technique_parsing_is_case_insensitive() {
        assert_eq!("cva".parse::<Technique>().unwrap(), Technique::Cva);
        assert_eq!("CV".parse::<Technique>().unwrap(), Technique::Cva);
        assert_eq!(" Peis ".parse::<Technique>().unwrap(), Technique::Peis);
        assert_eq!("lsv".parse::<Technique>().unwrap(), Technique::Lsv);
    }

    #[test]
    fn test_unknown_technique() {
        let err = "XYZ".parse::<Technique>().unwrap_err();
        assert!(err.to_string().contains("Unknown experiment type"));
    }

    #[test]
    fn test_missing_uo_type() {
        let request = UnitOperationRequest::default();
        let err = UnitOperation::from_request(&request).unwrap_err();
        assert!(err.to_string().contains("Missing uo_type"));
    }

    #[test]
    fn test_failure_result_serialization() {
        let err = EchemError::Connection("potentiostat offline".into());
        let result = ExperimentResult::failure("OCV", &err).with_id("abc");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["error_kind"], json!("connection"));
        assert_eq!(value["experiment_id"], json!("abc"));
    }

    #[test]
    fn test_submission_response_from_result() {
        let result = ExperimentResult::success("CP", JsonMap::new()).with_id("id-1");
        let response = SubmissionResponse::from(&result);
        assert_eq!(response.status, ResultStatus::Success);
        assert_eq!(response.experiment_id.as_deref(), Some("id-1"));
        assert!(response.message.is_none());
    }
}
