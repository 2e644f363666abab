use anyhow::Result;
use proxmed_core::{
    validate_password, ProxmedError, RegisterInput, Role, UpdateProfileInput, User,
};
use proxmed_store_sqlite::NewUser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::{hash_password, verify_password, TokenPair, TokenType};
use crate::envelope::Reply;
use crate::{Call, ProxmedApi};

const DEFAULT_SEARCH_LIMIT: i64 = 10;
const MAX_SEARCH_LIMIT: i64 = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthPayload {
    user: User,
    #[serde(flatten)]
    tokens: TokenPair,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginInput {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RefreshInput {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChangePasswordInput {
    old_password: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UserIdInput {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchInput {
    query: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenInput {
    token: String,
}

fn invalid_credentials() -> anyhow::Error {
    ProxmedError::Unauthenticated("Invalid email or password".to_string()).into()
}

impl ProxmedApi {
    pub(crate) fn register(&self, call: &Call) -> Result<Reply> {
        let input: RegisterInput = call.input()?;
        let email = input.validate()?;
        let hashed = hash_password(&input.password)?;
        let mut store = self.open_store()?;
        let user = store.create_user(&NewUser {
            full_name: input.full_name.as_deref(),
            contact_number: input.contact_number.as_deref(),
            bio: input.bio.as_deref(),
            ..NewUser::new(&email, &hashed, Role::User)
        })?;
        let tokens = self.tokens().issue_pair(user.id, &user.email)?;
        Reply::ok("User registered successfully", AuthPayload { user, tokens })
    }

    /// Inactive accounts are refused only after the password checks out, so
    /// the response does not reveal which addresses exist.
    pub(crate) fn login(&self, call: &Call) -> Result<Reply> {
        let input: LoginInput = call.input()?;
        let mut store = self.open_store()?;
        let user = store
            .get_user_by_email(&input.email)?
            .filter(|user| verify_password(&input.password, &user.hashed_password))
            .ok_or_else(invalid_credentials)?;
        if !user.is_active {
            return Err(ProxmedError::Forbidden("Account is inactive".to_string()).into());
        }

        store.touch_last_login(user.id)?;
        let user = store.get_user(user.id)?.ok_or_else(invalid_credentials)?;
        let tokens = self.tokens().issue_pair(user.id, &user.email)?;
        info!(user_id = user.id, "user logged in");
        Reply::ok("Login successful", AuthPayload { user, tokens })
    }

    pub(crate) fn refresh_access_token(&self, call: &Call) -> Result<Reply> {
        let RefreshInput { refresh_token } = call.input()?;
        let invalid = || ProxmedError::Unauthenticated("Invalid refresh token".to_string());
        let user_id = self
            .tokens()
            .verify(&refresh_token, TokenType::Refresh)
            .and_then(|claims| claims.user_id())
            .ok_or_else(invalid)?;
        let user = self
            .open_store()?
            .get_user(user_id)?
            .filter(|user| user.is_active)
            .ok_or_else(invalid)?;

        let access_token = self.tokens().issue(user.id, &user.email, TokenType::Access)?;
        Reply::ok(
            "Token refreshed successfully",
            TokenPair { access_token, refresh_token, token_type: "bearer" },
        )
    }

    pub(crate) fn change_password(&self, call: &Call) -> Result<Reply> {
        let input: ChangePasswordInput = call.input()?;
        let mut store = self.open_store()?;
        let Some(user) = self.current_user(call.bearer(), &store)? else {
            return Ok(Reply::declined("Not authenticated", Value::Bool(false)));
        };
        if !verify_password(&input.old_password, &user.hashed_password) {
            return Ok(Reply::declined("Current password is incorrect", Value::Bool(false)));
        }
        if let Err(err) = validate_password(&input.new_password) {
            return Ok(Reply::declined(err.to_string(), Value::Bool(false)));
        }

        let hashed = hash_password(&input.new_password)?;
        store.update_password(user.id, &hashed)?;
        Reply::ok("Password changed successfully", true)
    }

    pub(crate) fn update_profile(&self, call: &Call) -> Result<Reply> {
        let input: UpdateProfileInput = call.input()?;
        let mut store = self.open_store()?;
        let Some(user) = self.current_user(call.bearer(), &store)? else {
            return Ok(Reply::declined("Not authenticated", Value::Null));
        };
        let user = store.update_user_profile(user.id, &input)?;
        Reply::ok("Profile updated successfully", user)
    }

    pub(crate) fn me(&self, call: &Call) -> Result<Reply> {
        let store = self.open_store()?;
        match self.current_user(call.bearer(), &store)? {
            Some(user) => Reply::ok("User retrieved successfully", user),
            None => Ok(Reply::declined("Not authenticated", Value::Null)),
        }
    }

    pub(crate) fn get_user(&self, call: &Call) -> Result<Reply> {
        let UserIdInput { user_id } = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let user = store
            .get_user(user_id)?
            .ok_or_else(|| ProxmedError::not_found("User not found"))?;
        Reply::ok("User retrieved successfully", user)
    }

    pub(crate) fn search_users(&self, call: &Call) -> Result<Reply> {
        let input: SearchInput = call.input()?;
        let store = self.open_store()?;
        self.session(call, &store)?;
        let limit = input.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
        let users = store.search_users(&input.query, u32::try_from(limit).unwrap_or(10))?;
        Reply::ok("Users retrieved successfully", users)
    }

    pub(crate) fn verify_token(&self, call: &Call) -> Result<Reply> {
        let TokenInput { token } = call.input()?;
        let valid = self.tokens().verify(&token, TokenType::Access).is_some();
        let message = if valid { "Token is valid" } else { "Token is invalid" };
        Reply::ok(message, valid)
    }
}
