//! User operations
//!
//! Registration and profile changes stage USER_CREATED / USER_UPDATED with
//! the user document. Envelopes carry the public profile only.

use chrono::Utc;
use event_bus::{
    EntityStore, EventEnvelope, EventType, OutboxCoordinator, SourceService, StageError,
    StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::credentials::{AuthError, CredentialIssuer, PasswordPolicy};
use crate::models::{
    normalize_email, OrderHistoryEntry, ProfileUpdate, RegisterUser, User, UserRecord,
    ORDER_HISTORY, USERS,
};

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("invalid user: {0}")]
    Validation(String),

    #[error("email {0} is already registered")]
    EmailTaken(String),

    #[error("user {0} not found")]
    NotFound(String),

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

pub struct UserService {
    entities: Arc<dyn EntityStore>,
    outbox: Arc<OutboxCoordinator>,
    credentials: Arc<dyn CredentialIssuer>,
    passwords: PasswordPolicy,
}

impl UserService {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        outbox: Arc<OutboxCoordinator>,
        credentials: Arc<dyn CredentialIssuer>,
        passwords: PasswordPolicy,
    ) -> Self {
        Self {
            entities,
            outbox,
            credentials,
            passwords,
        }
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, UserError> {
        Ok(self
            .find_record(json!({ "userId": user_id }))
            .await?
            .map(User::from))
    }

    /// The user's view of one of their orders, as last reported by the order service
    pub async fn order_entry(
        &self,
        user_id: &str,
        order_id: &str,
    ) -> Result<Option<OrderHistoryEntry>, UserError> {
        match self
            .entities
            .find_one(ORDER_HISTORY, &json!({ "userId": user_id, "orderId": order_id }))
            .await?
        {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    pub async fn register_user(&self, request: RegisterUser) -> Result<User, UserError> {
        let email = normalize_email(&request.email);
        validate_email(&email)?;
        if request.password.chars().count() < self.passwords.min_len {
            return Err(UserError::Validation(format!(
                "password must be at least {} characters",
                self.passwords.min_len
            )));
        }

        if self.find_record(json!({ "email": email })).await?.is_some() {
            return Err(UserError::EmailTaken(email));
        }

        let now = Utc::now();
        let record = UserRecord {
            user_id: Uuid::new_v4().to_string(),
            email,
            password_hash: self.passwords.hash_password(&request.password)?,
            first_name: request.first_name,
            last_name: request.last_name,
            created_at: now,
            updated_at: now,
        };

        let staged = self.stage(record, EventType::UserCreated).await?;

        tracing::info!(
            user_id = %staged.0.user_id,
            event_id = %staged.1,
            "User registered"
        );
        Ok(staged.0.into())
    }

    pub async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<User, UserError> {
        let mut record = self
            .find_record(json!({ "userId": user_id }))
            .await?
            .ok_or_else(|| UserError::NotFound(user_id.to_string()))?;

        if let Some(email) = update.email {
            let email = normalize_email(&email);
            validate_email(&email)?;
            if email != record.email {
                if self.find_record(json!({ "email": email })).await?.is_some() {
                    return Err(UserError::EmailTaken(email));
                }
                record.email = email;
            }
        }
        if let Some(first_name) = update.first_name {
            record.first_name = Some(first_name);
        }
        if let Some(last_name) = update.last_name {
            record.last_name = Some(last_name);
        }
        record.updated_at = Utc::now();

        let staged = self.stage(record, EventType::UserUpdated).await?;

        tracing::info!(user_id = %user_id, event_id = %staged.1, "User profile updated");
        Ok(staged.0.into())
    }

    /// Check the password and issue an access token
    pub async fn login(&self, email: &str, password: &str) -> Result<String, UserError> {
        let email = normalize_email(email);
        let Some(record) = self.find_record(json!({ "email": email })).await? else {
            tracing::info!("Login rejected: unknown email");
            return Err(UserError::InvalidCredentials);
        };

        if !self.passwords.verify_password(password, &record.password_hash)? {
            tracing::info!(user_id = %record.user_id, "Login rejected: wrong password");
            return Err(UserError::InvalidCredentials);
        }

        let token = self.credentials.issue(&record.user_id, &record.email)?;
        tracing::info!(user_id = %record.user_id, "User logged in");
        Ok(token)
    }

    async fn find_record(&self, filter: Value) -> Result<Option<UserRecord>, UserError> {
        match self.entities.find_one(USERS, &filter).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    async fn stage(&self, record: UserRecord, event_type: EventType) -> Result<(UserRecord, Uuid), UserError> {
        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        USERS,
                        json!({ "userId": record.user_id }),
                        serde_json::to_value(&record).map_err(StoreError::from)?,
                    );
                    Ok::<_, UserError>(record)
                },
                |record| {
                    EventEnvelope::new(event_type, SourceService::UserService, profile_payload(record))
                },
            )
            .await?;

        Ok((staged.value, staged.envelope.id()))
    }
}

/// Public profile fields; absent names are left out rather than sent as null
fn profile_payload(record: &UserRecord) -> Value {
    let mut payload = json!({
        "userId": record.user_id,
        "email": record.email,
    });
    if let Some(first_name) = &record.first_name {
        payload["firstName"] = json!(first_name);
    }
    if let Some(last_name) = &record.last_name {
        payload["lastName"] = json!(last_name);
    }
    payload
}

fn validate_email(email: &str) -> Result<(), UserError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(UserError::Validation(format!("{email} is not a valid email"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("ada").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ada@localhost").is_err());
    }
}
