//! Request-scoped facade over the Proxmed store.
//!
//! Every operation opens its own store session, authenticates the bearer
//! token when it needs a caller, and answers with an [`ApiResponse`]
//! envelope. Business failures never escape as errors: they become
//! `success: false` with the failure's message. Only an unknown operation
//! name or input that does not decode is reported as a [`DispatchError`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use proxmed_core::{
    validate_password, ExpressionEvaluator, OpaqueExpressions, PasswordSignaturesOnly, ProxmedError,
    Role, SignerVerifier, User,
};
use proxmed_store_sqlite::{constraint_kind, domain_error, ConstraintKind, NewUser, SqliteStore};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

pub mod auth;
pub mod config;
mod envelope;
mod ops;

pub use auth::{hash_password, verify_password, Claims, TokenIssuer, TokenPair, TokenType};
pub use config::ProxmedConfig;
pub use envelope::ApiResponse;

use envelope::Reply;
use ops::{Effect, OPERATIONS};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("invalid input for `{operation}`: {message}")]
    InvalidInput { operation: String, message: String },
}

/// Input that could not be decoded into the operation's argument shape.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InputError(String);

/// One operation invocation: the raw bearer token and the JSON arguments.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    bearer: Option<String>,
    input: Value,
}

impl Call {
    fn new(bearer: Option<&str>, input: Value) -> Self {
        let input = if input.is_null() { Value::Object(Map::new()) } else { input };
        Self {
            bearer: bearer.map(str::trim).filter(|token| !token.is_empty()).map(str::to_string),
            input,
        }
    }

    pub(crate) fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    pub(crate) fn input<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.input.clone()).map_err(|err| InputError(err.to_string()).into())
    }
}

#[derive(Clone)]
pub struct ProxmedApi {
    config: Arc<ProxmedConfig>,
    tokens: TokenIssuer,
    evaluator: Arc<dyn ExpressionEvaluator>,
    signer_verifier: Arc<dyn SignerVerifier>,
}

impl std::fmt::Debug for ProxmedApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmedApi")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl ProxmedApi {
    /// # Errors
    /// Returns an error when `config` does not validate.
    pub fn new(config: ProxmedConfig) -> Result<Self> {
        config.validate()?;
        let tokens = TokenIssuer::new(&config);
        Ok(Self {
            config: Arc::new(config),
            tokens,
            evaluator: Arc::new(OpaqueExpressions),
            signer_verifier: Arc::new(PasswordSignaturesOnly),
        })
    }

    /// Replaces the evaluator used for branching logic and validation rules.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Enables OTP and SSO signatures by checking their credentials with
    /// `verifier`.
    #[must_use]
    pub fn with_signer_verifier(mut self, verifier: Arc<dyn SignerVerifier>) -> Self {
        self.signer_verifier = verifier;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ProxmedConfig {
        &self.config
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Names of every dispatchable operation, in table order.
    pub fn operations() -> impl Iterator<Item = &'static str> {
        OPERATIONS.iter().map(|operation| operation.name)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<()> {
        self.open_store()?.migrate()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_busy_timeout(
            &self.config.db_path,
            Duration::from_millis(self.config.busy_timeout_ms),
        )
    }

    /// Whether `operation` changes stored state. `None` for unknown names.
    #[must_use]
    pub fn is_write(operation: &str) -> Option<bool> {
        OPERATIONS
            .iter()
            .find(|entry| entry.name == operation)
            .map(|entry| entry.effect == Effect::Write)
    }

    /// Creates an account with an explicit role, bypassing self-registration.
    ///
    /// # Errors
    /// Returns an error for an invalid email, a weak password, a duplicate
    /// email or a storage failure.
    pub fn create_user_with_role(
        &self,
        email: &str,
        password: &str,
        role: Role,
        full_name: Option<&str>,
    ) -> Result<User> {
        validate_password(password)?;
        let hashed = hash_password(password)?;
        let mut store = self.open_store()?;
        let user = store.create_user(&NewUser {
            full_name,
            ..NewUser::new(email, &hashed, role)
        })?;
        info!(user_id = user.id, role = role.as_str(), "user created");
        Ok(user)
    }

    /// Runs one named operation.
    ///
    /// # Errors
    /// Returns [`DispatchError`] for an unknown operation name or arguments
    /// that do not decode. Every other failure is reported inside the
    /// envelope.
    pub fn execute(
        &self,
        operation: &str,
        bearer: Option<&str>,
        input: Value,
    ) -> Result<ApiResponse<Value>, DispatchError> {
        let Some(entry) = OPERATIONS.iter().find(|entry| entry.name == operation) else {
            return Err(DispatchError::UnknownOperation(operation.to_string()));
        };
        let call = Call::new(bearer, input);

        match (entry.handler)(self, &call) {
            Ok(reply) => {
                if entry.effect == Effect::Write && reply.success {
                    let id = reply.data.get("id").and_then(Value::as_i64);
                    info!(operation, ?id, "operation applied");
                }
                Ok(reply.into_response())
            }
            Err(err) => {
                if let Some(input_error) = err.downcast_ref::<InputError>() {
                    return Err(DispatchError::InvalidInput {
                        operation: operation.to_string(),
                        message: input_error.to_string(),
                    });
                }
                Ok(Self::soft_failure(operation, &err))
            }
        }
    }

    fn soft_failure(operation: &str, err: &anyhow::Error) -> ApiResponse<Value> {
        if let Some(domain) = domain_error(err) {
            warn!(operation, kind = domain.kind(), message = %domain, "operation rejected");
            return ApiResponse::failure(domain.to_string());
        }
        if matches!(
            constraint_kind(err),
            Some(ConstraintKind::Unique | ConstraintKind::ForeignKey)
        ) {
            warn!(operation, error = %format!("{err:#}"), "operation hit a constraint");
            return ApiResponse::failure(format!("{operation} failed: conflicting data"));
        }
        error!(operation, error = %format!("{err:#}"), "operation failed");
        ApiResponse::failure(format!("{operation} failed: internal error"))
    }

    /// The active account behind a valid access token, if any.
    pub(crate) fn current_user(&self, bearer: Option<&str>, store: &SqliteStore) -> Result<Option<User>> {
        let Some(user_id) = bearer
            .and_then(|token| self.tokens.verify(token, TokenType::Access))
            .and_then(|claims| claims.user_id())
        else {
            return Ok(None);
        };
        let user = store
            .get_user(user_id)
            .context("failed to load session user")?;
        Ok(user.filter(|user| user.is_active))
    }

    pub(crate) fn session(&self, call: &Call, store: &SqliteStore) -> Result<User> {
        self.current_user(call.bearer(), store)?
            .ok_or_else(|| ProxmedError::Unauthenticated("Not authenticated".to_string()).into())
    }

    pub(crate) fn require_admin(&self, call: &Call, store: &SqliteStore) -> Result<User> {
        let user = self.session(call, store)?;
        if !user.role.is_admin() {
            return Err(ProxmedError::Forbidden("Admin access required".to_string()).into());
        }
        Ok(user)
    }

    pub(crate) fn require_catalog_admin(&self, call: &Call, store: &SqliteStore) -> Result<()> {
        if self.config.require_admin_for_catalog {
            self.require_admin(call, store)?;
        }
        Ok(())
    }

    pub(crate) fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }

    pub(crate) fn signer_verifier(&self) -> &dyn SignerVerifier {
        self.signer_verifier.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use proxmed_core::Role;
    use serde_json::{json, Value};

    use crate::{ApiResponse, ProxmedApi, ProxmedConfig};

    pub(crate) const ADMIN_PASSWORD: &str = "Admin-pass-1";
    pub(crate) const USER_PASSWORD: &str = "User-pass-1";

    pub(crate) fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("proxmed-api-{}.sqlite3", ulid::Ulid::new()))
    }

    pub(crate) fn test_api() -> ProxmedApi {
        let api = match ProxmedApi::new(ProxmedConfig::dev(unique_temp_db_path())) {
            Ok(api) => api,
            Err(err) => panic!("failed to build api: {err:#}"),
        };
        if let Err(err) = api.migrate() {
            panic!("failed to migrate: {err:#}");
        }
        api
    }

    pub(crate) fn call(api: &ProxmedApi, operation: &str, bearer: Option<&str>, input: Value) -> ApiResponse<Value> {
        match api.execute(operation, bearer, input) {
            Ok(response) => response,
            Err(err) => panic!("{operation} was not dispatched: {err}"),
        }
    }

    pub(crate) fn ok(api: &ProxmedApi, operation: &str, bearer: Option<&str>, input: Value) -> Value {
        let response = call(api, operation, bearer, input);
        assert!(response.success, "{operation} failed: {}", response.message);
        response.data.unwrap_or(Value::Null)
    }

    pub(crate) fn id_of(data: &Value) -> i64 {
        data["id"].as_i64().unwrap_or_else(|| panic!("no id in {data}"))
    }

    pub(crate) struct Study {
        pub token: String,
        pub project_id: i64,
        pub form_id: i64,
        pub record_id: i64,
    }

    /// Classic (non-longitudinal) project with one `vitals` form holding a
    /// required `weight` field and an optional `note` field, plus one record.
    pub(crate) fn build_study(api: &ProxmedApi) -> Study {
        let token = login_as(api, "coordinator@example.org", Role::Admin);
        let auth = Some(token.as_str());
        let project_id = id_of(&ok(api, "createProject", auth, json!({"title": "Trial", "code": "TR-1"})));
        let form_id = id_of(&ok(
            api,
            "createForm",
            auth,
            json!({"projectId": project_id, "formName": "vitals", "formLabel": "Vitals"}),
        ));
        for (name, required) in [("weight", true), ("note", false)] {
            ok(
                api,
                "createField",
                auth,
                json!({"projectId": project_id, "field": {
                    "formId": form_id,
                    "fieldName": name,
                    "fieldLabel": name,
                    "fieldType": "text",
                    "isRequired": required
                }}),
            );
        }
        let record_id = id_of(&ok(
            api,
            "createRecord",
            auth,
            json!({"projectId": project_id, "recordKey": "1001"}),
        ));
        Study { token, project_id, form_id, record_id }
    }

    /// Creates an account with `role` and returns its access token.
    pub(crate) fn login_as(api: &ProxmedApi, email: &str, role: Role) -> String {
        let password = if role.is_admin() { ADMIN_PASSWORD } else { USER_PASSWORD };
        if let Err(err) = api.create_user_with_role(email, password, role, None) {
            panic!("failed to create {email}: {err:#}");
        }
        let data = ok(api, "login", None, json!({"email": email, "password": password}));
        data["accessToken"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| panic!("login returned no token: {data}"))
    }
}
