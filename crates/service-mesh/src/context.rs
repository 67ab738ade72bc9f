//! Trace context propagated on every outbound call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const HEADER_TRACE_ID: &str = "X-Trace-ID";
pub const HEADER_CORRELATION_ID: &str = "X-Correlation-ID";
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";
pub const HEADER_USER_ID: &str = "X-User-ID";
pub const HEADER_SESSION_ID: &str = "X-Session-ID";

/// Ambient request context. When absent at a call site, fresh ids are
/// generated so a trace always exists end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub trace_id: String,
    pub correlation_id: String,
    pub request_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn create() -> Self {
        Self {
            trace_id: format!("trace_{}", short_hex()),
            correlation_id: format!("corr_{}", short_hex()),
            request_id: format!("req_{}", short_hex()),
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::create()
        }
    }

    /// A child context shares trace and correlation ids but gets a fresh
    /// request id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            correlation_id: self.correlation_id.clone(),
            request_id: format!("req_{}", short_hex()),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// Header pairs to attach to an outbound request.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_TRACE_ID, self.trace_id.clone()),
            (HEADER_CORRELATION_ID, self.correlation_id.clone()),
            (HEADER_REQUEST_ID, self.request_id.clone()),
        ];
        if let Some(user_id) = &self.user_id {
            headers.push((HEADER_USER_ID, user_id.clone()));
        }
        if let Some(session_id) = &self.session_id {
            headers.push((HEADER_SESSION_ID, session_id.clone()));
        }
        headers
    }
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// User-visible error body shared by every layer's HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub correlation_id: String,
    pub request_id: String,
    pub path: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorEnvelope {
    pub fn new(error: &crate::IntegrationError, context: &RequestContext, path: &str) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            correlation_id: context.correlation_id.clone(),
            request_id: context.request_id.clone(),
            path: path.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}
