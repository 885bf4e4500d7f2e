//! API-friendly types: request bodies and response views.
//!
//! IDs in responses are serialised as plain strings via [`ApiId`](crate::model::mongodb::ApiId).

pub mod election;
pub mod vote;
pub mod voter;
