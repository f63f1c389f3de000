//! HTTP data-access client and record types for the appraise sync layer.
//!
//! This crate provides the collaborator functions the cache layer consumes:
//! record fetches, search, stats, approval history, and the three mutation
//! endpoints. The sync layer itself (store, scheduler, optimistic mutations,
//! push channel) lives in `appraise-sync`.

mod client;
mod config;
mod error;
mod types;

pub use client::RecordApi;
pub use config::{ApiConfig, CHANNEL_ROUTE, DEFAULT_API_BASE_URL, derive_channel_url};
pub use error::ApiError;
pub use types::{
    ApprovalAction, ApprovalEvent, ApprovalStatus, EvaluationRecord, RecordPatch, RecordStats,
    SearchParams, SignaturePayload,
};
