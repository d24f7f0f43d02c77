//! REST routes and their translation to management RPC calls.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tonic::codegen::InterceptedService;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::auth::{bearer_token, AuthError, TokenValidator};
use crate::component::{ComponentInterceptor, AUTHORIZATION_HEADER};
use crate::proto::application_manager_client::ApplicationManagerClient;
use crate::proto::{Application, ApplicationIdentifier};

type ManagerClient = ApplicationManagerClient<InterceptedService<Channel, ComponentInterceptor>>;

/// Shared router state.
#[derive(Clone)]
pub struct ProxyState {
    client: ManagerClient,
    validator: Arc<dyn TokenValidator>,
}

impl ProxyState {
    pub fn new(client: ManagerClient, validator: Arc<dyn TokenValidator>) -> Self {
        Self { client, validator }
    }
}

/// Token accepted by the bearer middleware, forwarded on the RPC call.
#[derive(Clone)]
struct BearerToken(String);

/// JSON form of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationBody {
    pub app_id: String,
    #[serde(default)]
    pub description: String,
}

impl From<Application> for ApplicationBody {
    fn from(app: Application) -> Self {
        Self {
            app_id: app.app_id,
            description: app.description,
        }
    }
}

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// gRPC status code.
    pub code: i32,
}

/// Build the proxy router.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/applications", post(register_application))
        .route(
            "/applications/:app_id",
            get(get_application).delete(delete_application),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// Map a gRPC status code to the HTTP status returned to REST callers.
pub fn status_to_http(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ProxyError(Status);

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = status_to_http(self.0.code());
        let body = ErrorBody {
            error: self.0.message().to_string(),
            code: self.0.code() as i32,
        };
        (status, Json(body)).into_response()
    }
}

impl From<Status> for ProxyError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        Self(err.into())
    }
}

/// Reject requests without an accepted bearer token before any RPC is made.
async fn require_bearer(
    State(state): State<ProxyState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    let token = bearer_token(header)?.to_string();
    if let Err(e) = state.validator.validate(&token) {
        warn!(path = %request.uri().path(), error = %e, "Rejected proxy request");
        return Err(e.into());
    }

    request.extensions_mut().insert(BearerToken(token));
    Ok(next.run(request).await)
}

fn forward<T>(message: T, token: &BearerToken) -> Result<tonic::Request<T>, ProxyError> {
    let value = MetadataValue::try_from(format!("Bearer {}", token.0))
        .map_err(|_| ProxyError::from(AuthError::Malformed))?;
    let mut request = tonic::Request::new(message);
    request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
    Ok(request)
}

async fn register_application(
    State(state): State<ProxyState>,
    Extension(token): Extension<BearerToken>,
    Json(body): Json<ApplicationBody>,
) -> Result<(StatusCode, Json<ApplicationBody>), ProxyError> {
    debug!(app_id = %body.app_id, "POST /applications");
    let mut client = state.client.clone();
    let app = Application {
        app_id: body.app_id.clone(),
        description: body.description.clone(),
    };
    client.register_application(forward(app, &token)?).await?;
    Ok((StatusCode::CREATED, Json(body)))
}

async fn get_application(
    State(state): State<ProxyState>,
    Extension(token): Extension<BearerToken>,
    Path(app_id): Path<String>,
) -> Result<Json<ApplicationBody>, ProxyError> {
    debug!(app_id = %app_id, "GET /applications/:app_id");
    let mut client = state.client.clone();
    let app = client
        .get_application(forward(ApplicationIdentifier { app_id }, &token)?)
        .await?
        .into_inner();
    Ok(Json(app.into()))
}

async fn delete_application(
    State(state): State<ProxyState>,
    Extension(token): Extension<BearerToken>,
    Path(app_id): Path<String>,
) -> Result<StatusCode, ProxyError> {
    debug!(app_id = %app_id, "DELETE /applications/:app_id");
    let mut client = state.client.clone();
    client
        .delete_application(forward(ApplicationIdentifier { app_id }, &token)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
