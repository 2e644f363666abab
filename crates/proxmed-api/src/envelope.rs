use anyhow::{Context, Result};
use proxmed_core::PaginationInfo;
use proxmed_store_sqlite::Page;
use serde::Serialize;
use serde_json::Value;

/// Transport envelope shared by every operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationInfo>,
}

impl ApiResponse<Value> {
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), data: None, pagination: None }
    }
}

/// What a handler produced before it is wrapped for the caller.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reply {
    pub success: bool,
    pub message: String,
    pub data: Value,
    pub pagination: Option<PaginationInfo>,
}

impl Reply {
    pub fn ok(message: impl Into<String>, data: impl Serialize) -> Result<Self> {
        Ok(Self {
            success: true,
            message: message.into(),
            data: serde_json::to_value(data).context("failed to encode response data")?,
            pagination: None,
        })
    }

    pub fn page<T: Serialize>(message: impl Into<String>, page: Page<T>) -> Result<Self> {
        let mut reply = Self::ok(message, page.items)?;
        reply.pagination = Some(page.pagination);
        Ok(reply)
    }

    /// A soft refusal that still carries a typed payload, such as `false`
    /// for a rejected password change or `null` for a missing session.
    pub fn declined(message: impl Into<String>, data: Value) -> Self {
        Self { success: false, message: message.into(), data, pagination: None }
    }

    pub fn into_response(self) -> ApiResponse<Value> {
        ApiResponse {
            success: self.success,
            message: self.message,
            data: Some(self.data),
            pagination: self.pagination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxmed_core::PageRequest;
    use serde_json::json;

    #[test]
    fn pagination_is_omitted_unless_listing() {
        let single = match Reply::ok("Plan retrieved successfully", json!({"id": 1})) {
            Ok(reply) => reply.into_response(),
            Err(err) => panic!("encode failed: {err}"),
        };
        let encoded = serde_json::to_value(&single).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(
            encoded,
            json!({"success": true, "message": "Plan retrieved successfully", "data": {"id": 1}})
        );

        let request = PageRequest::new(Some(2), Some(1));
        let page = Page { items: vec![json!("b")], pagination: PaginationInfo::new(request, 3) };
        let listed = match Reply::page("Plans retrieved successfully", page) {
            Ok(reply) => reply.into_response(),
            Err(err) => panic!("encode failed: {err}"),
        };
        let encoded = serde_json::to_value(&listed).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(encoded["pagination"]["totalPages"], json!(3));
        assert_eq!(encoded["pagination"]["hasNext"], json!(true));
        assert_eq!(encoded["pagination"]["hasPrev"], json!(true));
    }

    #[test]
    fn failures_carry_null_data() {
        let encoded = serde_json::to_value(ApiResponse::failure("Plan not found"))
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(encoded, json!({"success": false, "message": "Plan not found", "data": null}));
    }
}
