//! Operation table. Names follow the transport's camelCase operation names.

use anyhow::Result;

use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

mod accounts;
mod capture;
mod catalog;
mod compliance;
mod schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    Read,
    Write,
}

pub(crate) type Handler = fn(&ProxmedApi, &Call) -> Result<Reply>;

pub(crate) struct Operation {
    pub name: &'static str,
    pub effect: Effect,
    pub handler: Handler,
}

const fn read(name: &'static str, handler: Handler) -> Operation {
    Operation { name, effect: Effect::Read, handler }
}

const fn write(name: &'static str, handler: Handler) -> Operation {
    Operation { name, effect: Effect::Write, handler }
}

pub(crate) static OPERATIONS: &[Operation] = &[
    // entitlement catalog
    read("plans", ProxmedApi::plans),
    read("plan", ProxmedApi::plan),
    read("planBySlug", ProxmedApi::plan_by_slug),
    read("permissions", ProxmedApi::permissions),
    read("permission", ProxmedApi::permission),
    read("permissionByKey", ProxmedApi::permission_by_key),
    read("permissionsByFeature", ProxmedApi::permissions_by_feature),
    read("planFeatures", ProxmedApi::plan_features),
    read("planFeature", ProxmedApi::plan_feature),
    read("planFeatureByKey", ProxmedApi::plan_feature_by_key),
    read("subscriptions", ProxmedApi::subscriptions),
    read("subscription", ProxmedApi::subscription),
    write("createPlan", ProxmedApi::create_plan),
    write("updatePlan", ProxmedApi::update_plan),
    write("deletePlan", ProxmedApi::delete_plan),
    write("createPermission", ProxmedApi::create_permission),
    write("updatePermission", ProxmedApi::update_permission),
    write("deletePermission", ProxmedApi::delete_permission),
    write("createPlanFeature", ProxmedApi::create_plan_feature),
    write("updatePlanFeature", ProxmedApi::update_plan_feature),
    write("deletePlanFeature", ProxmedApi::delete_plan_feature),
    write("createSubscription", ProxmedApi::create_subscription),
    write("updateSubscriptionStatus", ProxmedApi::update_subscription_status),
    read("entitlements", ProxmedApi::entitlements),
    read("userEntitlements", ProxmedApi::user_entitlements),
    // accounts
    write("register", ProxmedApi::register),
    write("login", ProxmedApi::login),
    write("refreshAccessToken", ProxmedApi::refresh_access_token),
    write("changePassword", ProxmedApi::change_password),
    write("updateProfile", ProxmedApi::update_profile),
    read("me", ProxmedApi::me),
    read("getCurrentUser", ProxmedApi::me),
    read("getUser", ProxmedApi::get_user),
    read("searchUsers", ProxmedApi::search_users),
    read("verifyToken", ProxmedApi::verify_token),
    // project schema
    write("createProject", ProxmedApi::create_project),
    write("updateProject", ProxmedApi::update_project),
    read("project", ProxmedApi::project),
    read("projects", ProxmedApi::projects),
    write("createArm", ProxmedApi::create_arm),
    read("arms", ProxmedApi::arms),
    write("createEvent", ProxmedApi::create_event),
    read("events", ProxmedApi::events),
    write("createForm", ProxmedApi::create_form),
    read("forms", ProxmedApi::forms),
    write("createField", ProxmedApi::create_field),
    read("formFields", ProxmedApi::form_fields),
    write("assignFormToEvent", ProxmedApi::assign_form_to_event),
    read("eventForms", ProxmedApi::event_forms),
    write("createRecord", ProxmedApi::create_record),
    read("record", ProxmedApi::record),
    read("records", ProxmedApi::records),
    // capture
    write("setValue", ProxmedApi::set_value),
    write("setCalculatedValue", ProxmedApi::set_calculated_value),
    read("value", ProxmedApi::value),
    read("values", ProxmedApi::values),
    write("submitForm", ProxmedApi::submit_form),
    write("verifyForm", ProxmedApi::verify_form),
    read("formStatus", ProxmedApi::form_status),
    read("formStatuses", ProxmedApi::form_statuses),
    // compliance
    write("lockForm", ProxmedApi::lock_form),
    write("unlockForm", ProxmedApi::unlock_form),
    read("formLock", ProxmedApi::form_lock),
    read("sdvRule", ProxmedApi::sdv_rule),
    write("setSdvRule", ProxmedApi::set_sdv_rule),
    read("sdvStatus", ProxmedApi::sdv_status),
    write("setSdvStatus", ProxmedApi::set_sdv_status),
    read("sdvStatuses", ProxmedApi::sdv_statuses),
    read("reviewStatus", ProxmedApi::review_status),
    write("setReviewStatus", ProxmedApi::set_review_status),
    read("queryRule", ProxmedApi::query_rule),
    write("setQueryRule", ProxmedApi::set_query_rule),
    write("openQuery", ProxmedApi::open_query),
    write("respondToQuery", ProxmedApi::respond_to_query),
    write("transitionQuery", ProxmedApi::transition_query),
    read("query", ProxmedApi::query),
    read("queries", ProxmedApi::queries),
    read("queryMessages", ProxmedApi::query_messages),
    write("createSignatureMeaning", ProxmedApi::create_signature_meaning),
    read("signatureMeanings", ProxmedApi::signature_meanings),
    write("updateSignatureMeaning", ProxmedApi::update_signature_meaning),
    write("deleteSignatureMeaning", ProxmedApi::delete_signature_meaning),
    write("createSignature", ProxmedApi::create_signature),
    read("signatures", ProxmedApi::signatures),
    write("createValidationRule", ProxmedApi::create_validation_rule),
    read("validationRules", ProxmedApi::validation_rules),
    write("evaluateRule", ProxmedApi::evaluate_rule),
    write("ignoreValidationResult", ProxmedApi::ignore_validation_result),
    read("validationResults", ProxmedApi::validation_results),
    read("auditLog", ProxmedApi::audit_log),
];
