use anyhow::Result;
use proxmed_core::{
    today_utc, CreateFeatureInput, CreatePermissionInput, CreatePlanInput, CreateSubscriptionInput,
    PageRequest, ProxmedError, SubscriptionStatus, UpdateFeatureInput, UpdatePermissionInput,
    UpdatePlanInput,
};
use serde::Deserialize;
use serde_json::json;

use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListInput {
    page: Option<i64>,
    limit: Option<i64>,
    filter_input: Option<CatalogFilter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CatalogFilter {
    search: Option<String>,
    feature_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IdInput {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlugInput {
    slug: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct KeyInput {
    key_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FeaturePermissionsInput {
    feature_id: i64,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateInput<T> {
    id: i64,
    input: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubscriptionsInput {
    user_id: Option<i64>,
    status: Option<SubscriptionStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubscriptionStatusInput {
    id: i64,
    status: SubscriptionStatus,
    paid_status: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UserIdInput {
    user_id: i64,
}

impl ProxmedApi {
    pub(crate) fn plans(&self, call: &Call) -> Result<Reply> {
        let input: ListInput = call.input()?;
        let filter = input.filter_input.unwrap_or_default();
        let store = self.open_store()?;
        let page = store.list_plans(PageRequest::new(input.page, input.limit), filter.search.as_deref())?;
        Reply::page("Plans retrieved successfully", page)
    }

    pub(crate) fn plan(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let plan = self
            .open_store()?
            .get_plan(id)?
            .ok_or_else(|| ProxmedError::not_found("Plan not found"))?;
        Reply::ok("Plan retrieved successfully", plan)
    }

    pub(crate) fn plan_by_slug(&self, call: &Call) -> Result<Reply> {
        let SlugInput { slug } = call.input()?;
        let plan = self
            .open_store()?
            .get_plan_by_slug(&slug)?
            .ok_or_else(|| ProxmedError::not_found("Plan not found"))?;
        Reply::ok("Plan retrieved successfully", plan)
    }

    pub(crate) fn permissions(&self, call: &Call) -> Result<Reply> {
        let input: ListInput = call.input()?;
        let filter = input.filter_input.unwrap_or_default();
        let page = self.open_store()?.list_permissions(
            PageRequest::new(input.page, input.limit),
            filter.search.as_deref(),
            filter.feature_id,
        )?;
        Reply::page("Permissions retrieved successfully", page)
    }

    pub(crate) fn permission(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let permission = self
            .open_store()?
            .get_permission(id)?
            .ok_or_else(|| ProxmedError::not_found("Permission not found"))?;
        Reply::ok("Permission retrieved successfully", permission)
    }

    pub(crate) fn permission_by_key(&self, call: &Call) -> Result<Reply> {
        let KeyInput { key_name } = call.input()?;
        let permission = self
            .open_store()?
            .get_permission_by_key(&key_name)?
            .ok_or_else(|| ProxmedError::not_found("Permission not found"))?;
        Reply::ok("Permission retrieved successfully", permission)
    }

    pub(crate) fn permissions_by_feature(&self, call: &Call) -> Result<Reply> {
        let input: FeaturePermissionsInput = call.input()?;
        let store = self.open_store()?;
        if store.get_feature(input.feature_id)?.is_none() {
            return Err(ProxmedError::not_found("Feature not found").into());
        }
        let page = store.list_permissions(
            PageRequest::new(input.page, input.limit),
            None,
            Some(input.feature_id),
        )?;
        Reply::page("Permissions retrieved successfully", page)
    }

    pub(crate) fn plan_features(&self, _call: &Call) -> Result<Reply> {
        let features = self.open_store()?.list_features()?;
        Reply::ok("Features retrieved successfully", features)
    }

    pub(crate) fn plan_feature(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let feature = self
            .open_store()?
            .get_feature(id)?
            .ok_or_else(|| ProxmedError::not_found("Feature not found"))?;
        Reply::ok("Feature retrieved successfully", feature)
    }

    pub(crate) fn plan_feature_by_key(&self, call: &Call) -> Result<Reply> {
        let KeyInput { key_name } = call.input()?;
        let feature = self
            .open_store()?
            .get_feature_by_key(&key_name)?
            .ok_or_else(|| ProxmedError::not_found("Feature not found"))?;
        Reply::ok("Feature retrieved successfully", feature)
    }

    /// Admins may list anyone's subscriptions; everyone else only their own.
    pub(crate) fn subscriptions(&self, call: &Call) -> Result<Reply> {
        let input: SubscriptionsInput = call.input()?;
        let store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let user_id = if caller.role.is_admin() {
            input.user_id
        } else {
            match input.user_id {
                Some(user_id) if user_id != caller.id => {
                    return Err(ProxmedError::Forbidden(
                        "Cannot view another user's subscriptions".to_string(),
                    )
                    .into());
                }
                _ => Some(caller.id),
            }
        };
        let subscriptions = store.list_subscriptions(user_id, input.status)?;
        Reply::ok("Subscriptions retrieved successfully", subscriptions)
    }

    pub(crate) fn subscription(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let subscription = store
            .get_subscription(id)?
            .filter(|subscription| caller.role.is_admin() || subscription.user_id == caller.id)
            .ok_or_else(|| ProxmedError::not_found("Subscription not found"))?;
        Reply::ok("Subscription retrieved successfully", subscription)
    }

    pub(crate) fn create_plan(&self, call: &Call) -> Result<Reply> {
        let input: CreatePlanInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let plan = store.create_plan(&input)?;
        Reply::ok("Plan created successfully", plan)
    }

    pub(crate) fn update_plan(&self, call: &Call) -> Result<Reply> {
        let UpdateInput { id, input } = call.input::<UpdateInput<UpdatePlanInput>>()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let plan = store.update_plan(id, &input)?;
        Reply::ok("Plan updated successfully", plan)
    }

    pub(crate) fn delete_plan(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        store.delete_plan(id)?;
        Reply::ok("Plan deleted successfully", json!({ "id": id }))
    }

    pub(crate) fn create_permission(&self, call: &Call) -> Result<Reply> {
        let input: CreatePermissionInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let permission = store.create_permission(&input)?;
        Reply::ok("Permission created successfully", permission)
    }

    pub(crate) fn update_permission(&self, call: &Call) -> Result<Reply> {
        let UpdateInput { id, input } = call.input::<UpdateInput<UpdatePermissionInput>>()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let permission = store.update_permission(id, &input)?;
        Reply::ok("Permission updated successfully", permission)
    }

    pub(crate) fn delete_permission(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        store.delete_permission(id)?;
        Reply::ok("Permission deleted successfully", json!({ "id": id }))
    }

    pub(crate) fn create_plan_feature(&self, call: &Call) -> Result<Reply> {
        let input: CreateFeatureInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let feature = store.create_feature(&input)?;
        Reply::ok("Feature created successfully", feature)
    }

    pub(crate) fn update_plan_feature(&self, call: &Call) -> Result<Reply> {
        let UpdateInput { id, input } = call.input::<UpdateInput<UpdateFeatureInput>>()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let feature = store.update_feature(id, &input)?;
        Reply::ok("Feature updated successfully", feature)
    }

    pub(crate) fn delete_plan_feature(&self, call: &Call) -> Result<Reply> {
        let IdInput { id } = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        store.delete_feature(id)?;
        Reply::ok("Feature deleted successfully", json!({ "id": id }))
    }

    pub(crate) fn create_subscription(&self, call: &Call) -> Result<Reply> {
        let input: CreateSubscriptionInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let subscription = store.create_subscription(&input)?;
        Reply::ok("Subscription created successfully", subscription)
    }

    pub(crate) fn update_subscription_status(&self, call: &Call) -> Result<Reply> {
        let input: SubscriptionStatusInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_catalog_admin(call, &store)?;
        let subscription = store.update_subscription_status(input.id, input.status, input.paid_status)?;
        Reply::ok("Subscription status updated successfully", subscription)
    }

    pub(crate) fn entitlements(&self, call: &Call) -> Result<Reply> {
        let store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let entitlements =
            store.entitlements_for_user(caller.id, today_utc(), &self.config().free_plan_slug)?;
        Reply::ok("Entitlements retrieved successfully", entitlements)
    }

    pub(crate) fn user_entitlements(&self, call: &Call) -> Result<Reply> {
        let UserIdInput { user_id } = call.input()?;
        let store = self.open_store()?;
        let caller = self.session(call, &store)?;
        if caller.id != user_id && !caller.role.is_admin() {
            return Err(ProxmedError::Forbidden(
                "Cannot view another user's entitlements".to_string(),
            )
            .into());
        }
        if store.get_user(user_id)?.is_none() {
            return Err(ProxmedError::not_found("User not found").into());
        }
        let entitlements =
            store.entitlements_for_user(user_id, today_utc(), &self.config().free_plan_slug)?;
        Reply::ok("Entitlements retrieved successfully", entitlements)
    }
}
