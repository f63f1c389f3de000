//! Evaluation record types shared between the API client and the sync layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval progression of an evaluation record.
///
/// Records move forward only: `Pending` -> `EmployeeApproved` ->
/// `FullyApproved`. The server is the authority on transitions; the client
/// applies them speculatively and reconciles on the next fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting the employee's signature.
    #[default]
    Pending,
    /// Employee has signed; awaiting the evaluator.
    EmployeeApproved,
    /// Both parties have signed. Terminal.
    FullyApproved,
}

impl ApprovalStatus {
    /// Whether this status is terminal.
    pub fn is_final(&self) -> bool {
        matches!(self, ApprovalStatus::FullyApproved)
    }

    /// Wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::EmployeeApproved => "employee_approved",
            ApprovalStatus::FullyApproved => "fully_approved",
        }
    }
}

/// A single evaluation record as served by the backend.
///
/// The sync layer only merges the approval fields; everything else the server
/// sends is carried opaquely in `extra` and round-trips untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: i64,
    /// Employee under evaluation.
    pub employee: String,
    /// Evaluator responsible for sign-off.
    pub evaluator: String,
    /// Review period label, e.g. "2026-H1".
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    #[serde(default)]
    pub employee_signature: Option<String>,
    #[serde(default)]
    pub evaluator_signature: Option<String>,
    #[serde(default)]
    pub employee_approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub evaluator_approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Server-side modification marker.
    pub last_modified: DateTime<Utc>,
    /// Fields the sync layer does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EvaluationRecord {
    /// Apply an employee signature speculatively.
    ///
    /// Mirrors what the server does on the employee-approval endpoint; the
    /// authoritative values arrive with the next revalidation.
    pub fn with_employee_approval(&self, payload: &SignaturePayload) -> Self {
        let mut next = self.clone();
        next.approval_status = ApprovalStatus::EmployeeApproved;
        next.employee_signature = Some(payload.signature.clone());
        next.employee_approved_at = Some(Utc::now());
        next
    }

    /// Apply an evaluator signature speculatively, advancing to the terminal
    /// fully-approved state.
    pub fn with_evaluator_approval(&self, payload: &SignaturePayload) -> Self {
        let mut next = self.clone();
        next.approval_status = ApprovalStatus::FullyApproved;
        next.evaluator_signature = Some(payload.signature.clone());
        next.evaluator_approved_at = Some(Utc::now());
        next
    }

    /// Apply a generic field patch speculatively via JSON merge.
    ///
    /// Unknown fields land in `extra`; known fields overwrite in place. Falls
    /// back to the unpatched record if the merged document no longer parses
    /// as a record (a malformed patch must not poison the cache).
    pub fn with_patch(&self, patch: &RecordPatch) -> Self {
        let mut doc = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return self.clone(),
        };
        for (field, value) in &patch.fields {
            doc.insert(field.clone(), value.clone());
        }
        serde_json::from_value(serde_json::Value::Object(doc)).unwrap_or_else(|_| self.clone())
    }
}

/// A partial update to an evaluation record.
///
/// Kept as a JSON object so callers can patch fields the sync layer does not
/// model, matching the opaque-record contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPatch {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RecordPatch {
    /// Build a patch from field/value pairs.
    pub fn new(fields: impl IntoIterator<Item = (String, serde_json::Value)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Convenience for a single-field patch.
    pub fn field(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert(name.into(), value.into());
        Self { fields }
    }
}

/// Signature payload for the two approval endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    /// Signature blob (base64 PNG or typed name, server decides).
    pub signature: String,
    /// Display name of the signer.
    pub signed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Aggregate counts over the record collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total: u64,
    pub pending: u64,
    pub employee_approved: u64,
    pub fully_approved: u64,
}

/// What an approval-history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    EmployeeApproved,
    EvaluatorApproved,
    Reopened,
}

/// One entry in a record's approval history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: i64,
    pub record_id: i64,
    pub action: ApprovalAction,
    pub actor: String,
    #[serde(default)]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for a record search.
///
/// Carried inside the cache key for the search family, so equality and
/// hashing must be canonical: `canonical_query` renders fields in a fixed
/// order, and two parameter sets compare equal iff they address the same
/// result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl SearchParams {
    /// Canonical query-string rendering, used both on the wire and as the
    /// cache-key suffix.
    pub fn canonical_query(&self) -> String {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(evaluator) = &self.evaluator {
            pairs.push(("evaluator", evaluator.clone()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(text) = &self.text {
            pairs.push(("text", text.clone()));
        }
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: i64) -> EvaluationRecord {
        EvaluationRecord {
            id,
            employee: "Sam Okafor".to_string(),
            evaluator: "Priya Nair".to_string(),
            period: Some("2026-H1".to_string()),
            summary: None,
            approval_status: ApprovalStatus::Pending,
            employee_signature: None,
            evaluator_signature: None,
            employee_approved_at: None,
            evaluator_approved_at: None,
            created_at: Utc::now(),
            last_modified: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    fn signature() -> SignaturePayload {
        SignaturePayload {
            signature: "sig-blob".to_string(),
            signed_by: "Sam Okafor".to_string(),
            note: None,
        }
    }

    #[test]
    fn test_employee_approval_advances_status() {
        let next = record(1).with_employee_approval(&signature());
        assert_eq!(next.approval_status, ApprovalStatus::EmployeeApproved);
        assert_eq!(next.employee_signature.as_deref(), Some("sig-blob"));
        assert!(next.employee_approved_at.is_some());
        assert!(next.evaluator_signature.is_none());
    }

    #[test]
    fn test_evaluator_approval_is_terminal() {
        let next = record(1)
            .with_employee_approval(&signature())
            .with_evaluator_approval(&signature());
        assert_eq!(next.approval_status, ApprovalStatus::FullyApproved);
        assert!(next.approval_status.is_final());
        assert!(next.evaluator_approved_at.is_some());
    }

    #[test]
    fn test_patch_overwrites_known_field() {
        let patched = record(1).with_patch(&RecordPatch::field("summary", "updated text"));
        assert_eq!(patched.summary.as_deref(), Some("updated text"));
        assert_eq!(patched.id, 1);
    }

    #[test]
    fn test_patch_unknown_field_lands_in_extra() {
        let patched = record(1).with_patch(&RecordPatch::field("department", "engineering"));
        assert_eq!(
            patched.extra.get("department").and_then(|v| v.as_str()),
            Some("engineering")
        );
    }

    #[test]
    fn test_malformed_patch_leaves_record_unchanged() {
        // id must be an integer; a string here would break deserialization
        let original = record(7);
        let patched = original.with_patch(&RecordPatch::field("id", "not-a-number"));
        assert_eq!(patched, original);
    }

    #[test]
    fn test_record_roundtrip_preserves_extra() {
        let mut rec = record(3);
        rec.extra
            .insert("department".to_string(), serde_json::json!("sales"));
        let json = serde_json::to_string(&rec).unwrap();
        let back: EvaluationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::EmployeeApproved).unwrap(),
            "\"employee_approved\""
        );
        assert_eq!(
            serde_json::from_str::<ApprovalStatus>("\"fully_approved\"").unwrap(),
            ApprovalStatus::FullyApproved
        );
    }

    #[test]
    fn test_canonical_query_fixed_order() {
        let params = SearchParams {
            text: Some("quarterly".to_string()),
            status: Some(ApprovalStatus::Pending),
            evaluator: Some("Priya Nair".to_string()),
        };
        assert_eq!(
            params.canonical_query(),
            "evaluator=Priya Nair&status=pending&text=quarterly"
        );
    }

    #[test]
    fn test_canonical_query_empty() {
        assert_eq!(SearchParams::default().canonical_query(), "");
    }

    proptest! {
        // Equal params must render equal canonical queries, and differing
        // evaluator fields must not collide.
        #[test]
        fn canonical_query_respects_equality(
            evaluator_a in "[a-z]{1,8}",
            evaluator_b in "[a-z]{1,8}",
        ) {
            let a = SearchParams { evaluator: Some(evaluator_a.clone()), ..Default::default() };
            let b = SearchParams { evaluator: Some(evaluator_b.clone()), ..Default::default() };

            if evaluator_a == evaluator_b {
                prop_assert_eq!(a.canonical_query(), b.canonical_query());
            } else {
                prop_assert_ne!(a.canonical_query(), b.canonical_query());
            }
        }
    }
}
