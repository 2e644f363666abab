use anyhow::Result;
use proxmed_core::{
    AuthMethod, CreateValidationRuleInput, DataQuery, FieldKey, FormInstanceKey, PageRequest,
    ProxmedError, QueryMessage, QueryPriority, QueryRule, QueryStatus, ReviewStatus, RuleVerdict,
    SdvRule, SdvStatus, SignatureTarget, ValidationResultStatus,
};
use proxmed_store_sqlite::SignRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::verify_password;
use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProjectIdInput {
    project_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecordInput {
    project_id: i64,
    record_id: i64,
}

#[derive(Debug, Deserialize)]
struct LockInput {
    #[serde(flatten)]
    key: FormInstanceKey,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SdvStatusInput {
    #[serde(flatten)]
    key: FieldKey,
    status: SdvStatus,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewStatusInput {
    #[serde(flatten)]
    key: FieldKey,
    status: ReviewStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenQueryInput {
    #[serde(flatten)]
    key: FieldKey,
    message: String,
    #[serde(default)]
    priority: QueryPriority,
    assigned_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct QueryIdInput {
    query_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RespondInput {
    query_id: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TransitionInput {
    query_id: i64,
    status: QueryStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct QueriesInput {
    project_id: i64,
    record_id: Option<i64>,
    status: Option<QueryStatus>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryThread {
    #[serde(flatten)]
    query: DataQuery,
    messages: Vec<QueryMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateMeaningInput {
    project_id: i64,
    code: String,
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateMeaningInput {
    meaning_id: i64,
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MeaningIdInput {
    meaning_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SignInput {
    project_id: i64,
    meaning_id: i64,
    target: SignatureTarget,
    #[serde(default)]
    auth_method: AuthMethod,
    password: Option<String>,
    /// One-time code or SSO assertion for the non-password methods.
    credential: Option<String>,
    signer_ip: Option<String>,
    signer_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SignaturesInput {
    project_id: i64,
    record_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RulesInput {
    project_id: i64,
    #[serde(default)]
    active_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EvaluateInput {
    rule_id: i64,
    record_id: i64,
    event_id: Option<i64>,
    #[serde(default = "first_instance")]
    instance: u32,
    verdict: Option<RuleVerdict>,
}

fn first_instance() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResultIdInput {
    result_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResultsInput {
    project_id: i64,
    record_id: Option<i64>,
    status: Option<ValidationResultStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AuditInput {
    project_id: i64,
    record_id: Option<i64>,
    page: Option<i64>,
    limit: Option<i64>,
}

impl ProxmedApi {
    pub(crate) fn lock_form(&self, call: &Call) -> Result<Reply> {
        let LockInput { key, reason } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.require_admin(call, &store)?;
        let lock = store.lock_form(&key, caller.id, reason.as_deref())?;
        Reply::ok("Form locked successfully", lock)
    }

    pub(crate) fn unlock_form(&self, call: &Call) -> Result<Reply> {
        let key: FormInstanceKey = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.require_admin(call, &store)?;
        store.unlock_form(&key, caller.id)?;
        Reply::ok("Form unlocked successfully", key)
    }

    pub(crate) fn form_lock(&self, call: &Call) -> Result<Reply> {
        let key: FormInstanceKey = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        match store.get_form_lock(&key)? {
            Some(lock) => Reply::ok("Form is locked", lock),
            None => Reply::ok("Form is not locked", Value::Null),
        }
    }

    pub(crate) fn sdv_rule(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("SDV rule retrieved successfully", store.get_sdv_rule(project_id)?)
    }

    pub(crate) fn set_sdv_rule(&self, call: &Call) -> Result<Reply> {
        let rule: SdvRule = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        Reply::ok("SDV rule saved successfully", store.set_sdv_rule(&rule)?)
    }

    pub(crate) fn sdv_status(&self, call: &Call) -> Result<Reply> {
        let key: FieldKey = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("SDV status retrieved successfully", store.get_sdv_status(&key)?)
    }

    pub(crate) fn set_sdv_status(&self, call: &Call) -> Result<Reply> {
        let SdvStatusInput { key, status, note } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let sdv = store.set_sdv_status(&key, status, caller.id, note.as_deref())?;
        Reply::ok("SDV status updated successfully", sdv)
    }

    pub(crate) fn sdv_statuses(&self, call: &Call) -> Result<Reply> {
        let RecordInput { project_id, record_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "SDV statuses retrieved successfully",
            store.list_sdv_statuses(project_id, record_id)?,
        )
    }

    pub(crate) fn review_status(&self, call: &Call) -> Result<Reply> {
        let key: FieldKey = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Review status retrieved successfully", store.get_review_status(&key)?)
    }

    pub(crate) fn set_review_status(&self, call: &Call) -> Result<Reply> {
        let ReviewStatusInput { key, status } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let review = store.set_review_status(&key, status, caller.id)?;
        Reply::ok("Review status updated successfully", review)
    }

    pub(crate) fn query_rule(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok("Query rule retrieved successfully", store.get_query_rule(project_id)?)
    }

    pub(crate) fn set_query_rule(&self, call: &Call) -> Result<Reply> {
        let rule: QueryRule = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        Reply::ok("Query rule saved successfully", store.set_query_rule(&rule)?)
    }

    pub(crate) fn open_query(&self, call: &Call) -> Result<Reply> {
        let input: OpenQueryInput = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let query = store.open_query(
            &input.key,
            caller.id,
            &input.message,
            input.priority,
            input.assigned_to,
        )?;
        Reply::ok("Query opened successfully", query)
    }

    pub(crate) fn respond_to_query(&self, call: &Call) -> Result<Reply> {
        let RespondInput { query_id, message } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let query = store.respond_to_query(query_id, caller.id, &message)?;
        Reply::ok("Response recorded successfully", query)
    }

    pub(crate) fn transition_query(&self, call: &Call) -> Result<Reply> {
        let TransitionInput { query_id, status } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let query = store.transition_query(query_id, status, caller.id)?;
        Reply::ok("Query updated successfully", query)
    }

    pub(crate) fn query(&self, call: &Call) -> Result<Reply> {
        let QueryIdInput { query_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let query = store
            .get_query(query_id)?
            .ok_or_else(|| ProxmedError::not_found("Query not found"))?;
        let messages = store.query_messages(query_id)?;
        Reply::ok("Query retrieved successfully", QueryThread { query, messages })
    }

    pub(crate) fn queries(&self, call: &Call) -> Result<Reply> {
        let input: QueriesInput = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let page = store.list_queries(
            input.project_id,
            input.record_id,
            input.status,
            PageRequest::new(input.page, input.limit),
        )?;
        Reply::page("Queries retrieved successfully", page)
    }

    pub(crate) fn query_messages(&self, call: &Call) -> Result<Reply> {
        let QueryIdInput { query_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        if store.get_query(query_id)?.is_none() {
            return Err(ProxmedError::not_found("Query not found").into());
        }
        Reply::ok("Messages retrieved successfully", store.query_messages(query_id)?)
    }

    pub(crate) fn create_signature_meaning(&self, call: &Call) -> Result<Reply> {
        let input: CreateMeaningInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        let meaning = store.create_signature_meaning(input.project_id, &input.code, &input.label)?;
        Reply::ok("Signature meaning created successfully", meaning)
    }

    pub(crate) fn signature_meanings(&self, call: &Call) -> Result<Reply> {
        let ProjectIdInput { project_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Signature meanings retrieved successfully",
            store.list_signature_meanings(project_id)?,
        )
    }

    pub(crate) fn update_signature_meaning(&self, call: &Call) -> Result<Reply> {
        let UpdateMeaningInput { meaning_id, label } = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        let meaning = store.update_signature_meaning(meaning_id, &label)?;
        Reply::ok("Signature meaning updated successfully", meaning)
    }

    pub(crate) fn delete_signature_meaning(&self, call: &Call) -> Result<Reply> {
        let MeaningIdInput { meaning_id } = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        store.delete_signature_meaning(meaning_id)?;
        Reply::ok("Signature meaning deleted successfully", json!({ "id": meaning_id }))
    }

    /// Every signature re-authenticates the signer: password signatures
    /// against the stored hash, one-time codes and SSO assertions through
    /// the configured [`proxmed_core::SignerVerifier`].
    pub(crate) fn create_signature(&self, call: &Call) -> Result<Reply> {
        let input: SignInput = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let verified = match input.auth_method {
            AuthMethod::Password => input
                .password
                .as_deref()
                .is_some_and(|password| verify_password(password, &caller.hashed_password)),
            method => match input.credential.as_deref().map(str::trim) {
                Some(credential) if !credential.is_empty() => {
                    self.signer_verifier().verify(caller.id, method, credential)?
                }
                _ => false,
            },
        };
        if !verified {
            return Err(ProxmedError::Unauthenticated(
                "Signature credentials could not be verified".to_string(),
            )
            .into());
        }

        let signature = store.create_signature(&SignRequest {
            project_id: input.project_id,
            user_id: caller.id,
            meaning_id: input.meaning_id,
            target: input.target,
            auth_method: input.auth_method,
            signer_ip: input.signer_ip,
            signer_agent: input.signer_agent,
        })?;
        Reply::ok("Signature recorded successfully", signature)
    }

    pub(crate) fn signatures(&self, call: &Call) -> Result<Reply> {
        let SignaturesInput { project_id, record_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Signatures retrieved successfully",
            store.list_signatures(project_id, record_id)?,
        )
    }

    pub(crate) fn create_validation_rule(&self, call: &Call) -> Result<Reply> {
        let input: CreateValidationRuleInput = call.input()?;
        let mut store = self.open_store()?;
        self.require_admin(call, &store)?;
        let rule = store.create_validation_rule(&input)?;
        Reply::ok("Validation rule created successfully", rule)
    }

    pub(crate) fn validation_rules(&self, call: &Call) -> Result<Reply> {
        let RulesInput { project_id, active_only } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Validation rules retrieved successfully",
            store.list_validation_rules(project_id, active_only)?,
        )
    }

    /// Applies a caller-supplied verdict, or asks the configured evaluator
    /// for one when the input carries none.
    pub(crate) fn evaluate_rule(&self, call: &Call) -> Result<Reply> {
        let input: EvaluateInput = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let rule = store.get_validation_rule(input.rule_id)?.ok_or_else(|| {
            ProxmedError::not_found(format!("Validation rule with ID {} not found", input.rule_id))
        })?;
        if !rule.is_active {
            return Err(ProxmedError::InvalidTransition(format!(
                "Validation rule '{}' is inactive",
                rule.name
            ))
            .into());
        }

        let verdict = match input.verdict {
            Some(verdict) => verdict,
            None => {
                let values = store.record_values(
                    rule.project_id,
                    input.record_id,
                    input.event_id,
                    input.instance,
                )?;
                self.evaluator().evaluate_rule(&rule.expression, &values)?
            }
        };
        let application = store.apply_rule_verdict(
            rule.id,
            input.record_id,
            input.event_id,
            input.instance,
            &verdict,
            caller.id,
        )?;
        Reply::ok("Validation rule evaluated successfully", application)
    }

    pub(crate) fn ignore_validation_result(&self, call: &Call) -> Result<Reply> {
        let ResultIdInput { result_id } = call.input()?;
        let mut store = self.open_store()?;
        let caller = self.session(call, &store)?;
        let result = store.ignore_validation_result(result_id, caller.id)?;
        Reply::ok("Validation result ignored", result)
    }

    pub(crate) fn validation_results(&self, call: &Call) -> Result<Reply> {
        let ResultsInput { project_id, record_id, status } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        Reply::ok(
            "Validation results retrieved successfully",
            store.list_validation_results(project_id, record_id, status)?,
        )
    }

    pub(crate) fn audit_log(&self, call: &Call) -> Result<Reply> {
        let input: AuditInput = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let page = store.list_audit(
            input.project_id,
            input.record_id,
            PageRequest::new(input.page, input.limit),
        )?;
        Reply::page("Audit log retrieved successfully", page)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use proxmed_core::{AuthMethod, ExpressionEvaluator, ProxmedError, RuleVerdict, SignerVerifier};
    use serde_json::{json, Value};

    use crate::test_support::{build_study, call, id_of, ok, test_api, Study, ADMIN_PASSWORD};
    use crate::ProxmedApi;

    fn complete_vitals(api: &ProxmedApi, study: &Study) -> Value {
        let auth = Some(study.token.as_str());
        ok(
            api,
            "setValue",
            auth,
            json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": "weight", "value": "70"}),
        );
        let form_key = json!({"projectId": study.project_id, "recordId": study.record_id, "formId": study.form_id});
        ok(api, "submitForm", auth, form_key.clone());
        ok(api, "verifyForm", auth, form_key.clone());
        form_key
    }

    #[test]
    fn locking_waits_for_source_data_verification() {
        let api = test_api();
        let study = build_study(&api);
        let auth = Some(study.token.as_str());
        let form_key = complete_vitals(&api, &study);

        ok(
            &api,
            "setSdvRule",
            auth,
            json!({"projectId": study.project_id, "requireSdvBeforeLock": true, "requireSdvForAllFields": true}),
        );
        let blocked = call(&api, "lockForm", auth, form_key.clone());
        assert!(!blocked.success);
        assert!(blocked.message.contains("source data verification is incomplete"), "{}", blocked.message);

        for (field, status) in [("weight", "verified"), ("note", "not_required")] {
            ok(
                &api,
                "setSdvStatus",
                auth,
                json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": field, "status": status}),
            );
        }
        let mut lock_input = form_key.clone();
        lock_input["reason"] = json!("database freeze");
        let lock = ok(&api, "lockForm", auth, lock_input);
        assert_eq!(lock["reason"], json!("database freeze"));

        let write = call(
            &api,
            "setValue",
            auth,
            json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": "weight", "value": "71"}),
        );
        assert!(!write.success);

        ok(&api, "unlockForm", auth, form_key.clone());
        assert_eq!(ok(&api, "formLock", auth, form_key), Value::Null);
    }

    #[test]
    fn resolved_queries_can_be_signed_with_a_password() {
        let api = test_api();
        let study = build_study(&api);
        let auth = Some(study.token.as_str());

        let query = ok(
            &api,
            "openQuery",
            auth,
            json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": "weight",
                   "message": "Please confirm the unit", "priority": "high"}),
        );
        let query_id = id_of(&query);
        assert_eq!(query["status"], json!("open"));
        let answered = ok(&api, "respondToQuery", auth, json!({"queryId": query_id, "message": "kg"}));
        assert_eq!(answered["status"], json!("answered"));

        let skip = call(&api, "transitionQuery", auth, json!({"queryId": query_id, "status": "open"}));
        assert!(!skip.success);
        let resolved = ok(&api, "transitionQuery", auth, json!({"queryId": query_id, "status": "resolved"}));
        assert!(resolved["resolvedAt"].is_string());

        let thread = ok(&api, "query", auth, json!({"queryId": query_id}));
        assert_eq!(thread["messages"].as_array().map(Vec::len), Some(2));

        let meaning = ok(
            &api,
            "createSignatureMeaning",
            auth,
            json!({"projectId": study.project_id, "code": "approve", "label": "I approve"}),
        );
        let request = json!({
            "projectId": study.project_id,
            "meaningId": id_of(&meaning),
            "target": {"entityType": "query", "queryId": query_id},
            "password": "not-my-password"
        });
        let refused = call(&api, "createSignature", auth, request.clone());
        assert_eq!(refused.message, "Signature credentials could not be verified");

        let mut request = request;
        request["password"] = json!(ADMIN_PASSWORD);
        let signature = ok(&api, "createSignature", auth, request);
        assert_eq!(signature["target"]["entityType"], json!("query"));
        assert_eq!(signature["signedHash"].as_str().map(str::len), Some(64));

        let listed = ok(&api, "signatures", auth, json!({"projectId": study.project_id}));
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }

    struct FixedCode;

    impl SignerVerifier for FixedCode {
        fn verify(&self, _user_id: i64, method: AuthMethod, credential: &str) -> Result<bool, ProxmedError> {
            Ok(method == AuthMethod::Otp && credential == "424242")
        }
    }

    fn closed_query_signature(api: &ProxmedApi, study: &Study) -> Value {
        let auth = Some(study.token.as_str());
        let query = ok(
            api,
            "openQuery",
            auth,
            json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": "weight",
                   "message": "Check the scale"}),
        );
        ok(api, "transitionQuery", auth, json!({"queryId": id_of(&query), "status": "closed"}));
        let meaning = ok(
            api,
            "createSignatureMeaning",
            auth,
            json!({"projectId": study.project_id, "code": "close", "label": "I closed this"}),
        );
        json!({
            "projectId": study.project_id,
            "meaningId": id_of(&meaning),
            "target": {"entityType": "query", "queryId": id_of(&query)},
        })
    }

    #[test]
    fn otp_and_sso_signatures_need_a_verified_credential() {
        let api = test_api();
        let study = build_study(&api);
        let auth = Some(study.token.as_str());
        let request = closed_query_signature(&api, &study);

        for method in ["otp", "sso"] {
            let mut bare = request.clone();
            bare["authMethod"] = json!(method);
            let refused = call(&api, "createSignature", auth, bare.clone());
            assert!(!refused.success);
            assert_eq!(refused.message, "Signature credentials could not be verified");

            bare["credential"] = json!("424242");
            let unverifiable = call(&api, "createSignature", auth, bare);
            assert!(!unverifiable.success);
            assert!(unverifiable.message.starts_with("configuration error"), "{}", unverifiable.message);
        }
        let listed = ok(&api, "signatures", auth, json!({"projectId": study.project_id}));
        assert_eq!(listed.as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn configured_verifier_accepts_valid_one_time_codes() {
        let api = test_api().with_signer_verifier(Arc::new(FixedCode));
        let study = build_study(&api);
        let auth = Some(study.token.as_str());
        let mut request = closed_query_signature(&api, &study);
        request["authMethod"] = json!("otp");

        request["credential"] = json!("000000");
        let wrong = call(&api, "createSignature", auth, request.clone());
        assert_eq!(wrong.message, "Signature credentials could not be verified");

        request["credential"] = json!("424242");
        let signature = ok(&api, "createSignature", auth, request.clone());
        assert_eq!(signature["authMethod"], json!("otp"));

        request["authMethod"] = json!("sso");
        let sso = call(&api, "createSignature", auth, request);
        assert!(!sso.success);
    }

    #[test]
    fn rule_verdicts_open_and_resolve_results() {
        let api = test_api();
        let study = build_study(&api);
        let auth = Some(study.token.as_str());
        let rule = ok(
            &api,
            "createValidationRule",
            auth,
            json!({"projectId": study.project_id, "name": "weight range", "severity": "error",
                   "scope": "field", "targetFieldName": "weight", "expression": "[weight] < 300",
                   "message": "Weight out of range", "createQueryOnFail": true}),
        );
        let rule_id = id_of(&rule);

        let unevaluated = call(&api, "evaluateRule", auth, json!({"ruleId": rule_id, "recordId": study.record_id}));
        assert!(!unevaluated.success);
        assert!(unevaluated.message.starts_with("configuration error"));

        let failed = ok(
            &api,
            "evaluateRule",
            auth,
            json!({"ruleId": rule_id, "recordId": study.record_id,
                   "verdict": {"outcome": "fail", "details": {"weight": "350"}}}),
        );
        assert!(failed["openedQueryId"].is_i64());
        let result_id = failed["activeResult"]["id"].as_i64().unwrap_or_else(|| panic!("no result: {failed}"));

        let passed = ok(
            &api,
            "evaluateRule",
            auth,
            json!({"ruleId": rule_id, "recordId": study.record_id, "verdict": {"outcome": "pass"}}),
        );
        assert_eq!(passed["resolvedResultIds"], json!([result_id]));

        let ignored = call(&api, "ignoreValidationResult", auth, json!({"resultId": result_id}));
        assert!(!ignored.success);

        let resolved = ok(
            &api,
            "validationResults",
            auth,
            json!({"projectId": study.project_id, "status": "resolved"}),
        );
        assert_eq!(resolved.as_array().map(Vec::len), Some(1));
    }

    struct AlwaysFails;

    impl ExpressionEvaluator for AlwaysFails {
        fn is_field_applicable(&self, _: &str, _: &BTreeMap<String, String>) -> Result<bool, ProxmedError> {
            Ok(true)
        }

        fn evaluate_rule(
            &self,
            expression: &str,
            values: &BTreeMap<String, String>,
        ) -> Result<RuleVerdict, ProxmedError> {
            Ok(RuleVerdict::Fail {
                details: Some(json!({"expression": expression, "fields": values.len()})),
            })
        }
    }

    #[test]
    fn configured_evaluator_supplies_missing_verdicts() {
        let api = test_api().with_evaluator(Arc::new(AlwaysFails));
        let study = build_study(&api);
        let auth = Some(study.token.as_str());
        ok(
            &api,
            "setValue",
            auth,
            json!({"projectId": study.project_id, "recordId": study.record_id, "fieldName": "weight", "value": "70"}),
        );
        let rule = ok(
            &api,
            "createValidationRule",
            auth,
            json!({"projectId": study.project_id, "name": "record check", "scope": "record",
                   "expression": "[weight] > 0", "message": "Check the record"}),
        );
        let applied = ok(&api, "evaluateRule", auth, json!({"ruleId": id_of(&rule), "recordId": study.record_id}));
        assert_eq!(applied["verdict"]["outcome"], json!("fail"));
        assert_eq!(applied["activeResult"]["details"]["fields"], json!(1));
        assert_eq!(applied["openedQueryId"], Value::Null);
    }
}
