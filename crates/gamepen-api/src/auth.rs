use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info};

use gamepen_types::api::{AuthResponse, Claims, LoginRequest, SignupRequest, UserProfile};

use crate::AppState;
use crate::error::ApiError;

const TOKEN_LIFETIME_DAYS: i64 = 30;

const DUPLICATE_USER: &str = "Username or email already exists";

pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_string();
    let password = req.password;

    // Validate input
    if username.is_empty() || email.is_empty() || password.is_empty() {
        return Err(ApiError::BadRequest(
            "Username, email and password are required".into(),
        ));
    }
    if !(3..=32).contains(&username.chars().count()) {
        return Err(ApiError::BadRequest(
            "Username must be between 3 and 32 characters".into(),
        ));
    }
    // Usernames and emails share one login identifier space
    if username.contains('@') {
        return Err(ApiError::BadRequest("Username cannot contain '@'".into()));
    }
    if !email.contains('@') {
        return Err(ApiError::BadRequest("Invalid email address".into()));
    }
    if password.len() < 8 {
        return Err(ApiError::BadRequest(
            "Password must be at least 8 characters".into(),
        ));
    }

    let db = state.db.clone();
    let user: UserProfile = run_blocking(move || {
        if db.user_exists(&username, &email)? {
            return Err(ApiError::BadRequest(DUPLICATE_USER.into()));
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?
            .to_string();

        // A concurrent signup can still win the UNIQUE constraint
        let user_id = db
            .create_user(&username, &email, &password_hash)?
            .ok_or_else(|| ApiError::BadRequest(DUPLICATE_USER.into()))?;

        let row = db
            .get_user_by_id(user_id)?
            .ok_or_else(|| anyhow::anyhow!("User {} missing right after insert", user_id))?;
        Ok(row.into())
    })
    .await?;

    let token = create_token(&state.jwt_secret, &user)?;
    info!("New user {} ({})", user.username, user.id);

    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

/// Identifier a login request names, by the field the client filled in.
enum LoginIdentifier {
    Username(String),
    Email(String),
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identifier = non_blank(req.username.as_deref())
        .map(LoginIdentifier::Username)
        .or_else(|| non_blank(req.email.as_deref()).map(LoginIdentifier::Email))
        .ok_or_else(|| ApiError::BadRequest("Username or email is required".into()))?;

    if req.password.is_empty() {
        return Err(ApiError::BadRequest("Password is required".into()));
    }
    let password = req.password;

    let db = state.db.clone();
    let user: UserProfile = run_blocking(move || {
        let user = match &identifier {
            LoginIdentifier::Username(username) => db.get_user_by_username(username)?,
            LoginIdentifier::Email(email) => db.get_user_by_email(email)?,
        }
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".into()))?;

        // Verify password
        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("Corrupt password hash for user {}: {}", user.id, e))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthorized("Invalid credentials".into()))?;

        Ok(user.into())
    })
    .await?;

    let token = create_token(&state.jwt_secret, &user)?;

    Ok(Json(AuthResponse { token, user }))
}

/// GET /api/auth/me: profile of the token's subject.
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))?;

    let db = state.db.clone();
    let user: UserProfile = run_blocking(move || {
        let row = db
            .get_user_by_id(user_id)?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
        Ok(row.into())
    })
    .await?;

    Ok(Json(user))
}

pub fn create_token(secret: &str, user: &UserProfile) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Run SQLite and Argon2 work off the async runtime.
async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(anyhow::anyhow!("auth task failed"))
    })?
}
